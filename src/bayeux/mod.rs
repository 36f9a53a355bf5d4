//! A module for handling bayeux connections. Hello Comet!
//!
//! Refer to the Bayeux protocol description for the message shapes;
//! the module consumes a JSON message (single object or array) from
//! the request body, dispatches on the `channel` field, and either
//! answers immediately or retains the HTTP response as the client's
//! long-lived polling connection. Events published to a channel fan
//! out as multipart fragments over the retained connections.

mod channel;

pub use self::channel::{Channel, PlainChannel};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::{json, Value};

use crate::connection::ConnId;
use crate::http::body::{BodyKind, BodyPart};
use crate::http::handler::{HandlerEvent, HandlerStage};
use crate::http::module::{next_module_id, HttpModule, ModuleCtx};
use crate::http::request::Request;

const FIELD_CHANNEL: &'static str = "channel";
const FIELD_DATA: &'static str = "data";
const FIELD_VERSION: &'static str = "version";
const FIELD_MINVERSION: &'static str = "minimumVersion";
const FIELD_CONNTYPE: &'static str = "connectionType";
const FIELD_SUPPORTED_CONNTYPES: &'static str =
    "supportedConnectionTypes";
const FIELD_CLIENTID: &'static str = "clientId";
const FIELD_SUCCESSFUL: &'static str = "successful";
const FIELD_AUTHSUCCESSFUL: &'static str = "authSuccessful";
const FIELD_SUBSCRIPTION: &'static str = "subscription";
const FIELD_FIRSTCONN: &'static str = "firstconn";
const FIELD_SUBSCRIBED: &'static str = "subscribed";

/// `process_message` verdicts: error, reply-now, retain-connection.
const MSG_ERROR: i32 = -1;
const MSG_SEND: i32 = 0;
const MSG_RETAIN: i32 = 1;

struct Registry {
    /// Channels that are currently registered.
    channels: HashMap<String, Box<dyn Channel>>,
    /// channel name -> subscribed client ids, in subscription order
    subscriptions: HashMap<String, Vec<String>>,
    /// client id -> the connection retained for fan-out
    clients: HashMap<String, ConnId>,
}

pub struct BayeuxModule {
    id: usize,
    next: Arc<dyn HttpModule>,
    boundary: String,
    handler: Mutex<Weak<HandlerStage>>,
    registry: Mutex<Registry>,
}

impl BayeuxModule {
    pub fn new(next: Arc<dyn HttpModule>, boundary: &str)
        -> BayeuxModule
    {
        BayeuxModule {
            id: next_module_id(),
            next: next,
            boundary: boundary.to_string(),
            handler: Mutex::new(Weak::new()),
            registry: Mutex::new(Registry {
                channels: HashMap::new(),
                subscriptions: HashMap::new(),
                clients: HashMap::new(),
            }),
        }
    }

    /// The stage fan-out events are queued on.
    pub fn bind_handler(&self, stage: &Arc<HandlerStage>) {
        *self.handler.lock().expect("handler ref poisoned") =
            Arc::downgrade(stage);
    }

    pub fn register_channel(&self, channel: Box<dyn Channel>,
                            replace: bool)
        -> bool
    {
        let mut registry = self.lock_registry();
        let name = channel.name().to_string();
        if registry.channels.contains_key(&name) && !replace {
            return false;
        }
        registry.channels.insert(name, channel);
        true
    }

    pub fn unregister_channel(&self, name: &str) -> bool {
        self.lock_registry().channels.remove(name).is_some()
    }

    /// Register `(client -> retained connection)`; false if known.
    fn add_client(&self, client_id: &str, conn: ConnId) -> bool {
        let mut registry = self.lock_registry();
        if registry.clients.contains_key(client_id) {
            return false;
        }
        registry.clients.insert(client_id.to_string(), conn);
        true
    }

    /// Drop a client and scrub it from every subscription list.
    pub fn remove_client(&self, client_id: &str) -> Option<ConnId> {
        let mut registry = self.lock_registry();
        let conn = registry.clients.remove(client_id);
        for subscribers in registry.subscriptions.values_mut() {
            subscribers.retain(|id| id != client_id);
        }
        conn
    }

    fn add_subscription(&self, channel: &str, client_id: &str) -> bool {
        let mut registry = self.lock_registry();
        let subscribers = registry.subscriptions
            .entry(channel.to_string())
            .or_default();
        if subscribers.iter().any(|id| id == client_id) {
            return false;
        }
        subscribers.push(client_id.to_string());
        true
    }

    /// Find the channel's client list and remove the client; false if
    /// either lookup fails.
    fn remove_subscription(&self, channel: &str, client_id: &str)
        -> bool
    {
        let mut registry = self.lock_registry();
        match registry.subscriptions.get_mut(channel) {
            Some(subscribers) => {
                match subscribers.iter().position(|id| id == client_id) {
                    Some(pos) => {
                        subscribers.remove(pos);
                        true
                    }
                    None => false,
                }
            }
            None => false,
        }
    }

    /// Deliver an event to all subscribers of a channel.
    ///
    /// Each fan-out is a single body part routed through the module
    /// pipeline of the retained response, so content framing applies
    /// exactly as it does for direct replies.
    pub fn deliver_event(&self, channel: &str, data: &Value) {
        let stage = match self.handler.lock()
            .expect("handler ref poisoned").upgrade()
        {
            Some(stage) => stage,
            None => return,
        };
        let targets: Vec<ConnId> = {
            let registry = self.lock_registry();
            match registry.subscriptions.get(channel) {
                Some(subscribers) => subscribers.iter()
                    .filter_map(|id| registry.clients.get(id).cloned())
                    .collect(),
                None => return,
            }
        };
        let envelope = json!({
            (FIELD_CHANNEL): channel,
            (FIELD_DATA): data,
        });
        let payload = serde_json::to_vec(&envelope)
            .expect("JSON value always serialises");
        debug!("delivering {} bytes on {:?} to {} subscribers",
               payload.len(), channel, targets.len());
        for conn in targets {
            stage.queue_event(HandlerEvent::Deliver {
                conn: conn,
                from: self.id,
                module: self.next.clone(),
                payload: payload.clone(),
            });
        }
    }

    /// Process one message; the result selects the reply path.
    fn process_message(&self, message: &Value, output: &mut Value,
                       conn: ConnId)
        -> i32
    {
        let channel = message.get(FIELD_CHANNEL)
            .and_then(Value::as_str)
            .unwrap_or("");
        if channel.is_empty() {
            *output = Value::String("Channel name missing".to_string());
            return MSG_ERROR;
        }
        if channel.starts_with("/meta/") {
            match channel {
                "/meta/handshake" => self.process_handshake(output),
                "/meta/connect" => self.process_connect(message, output),
                "/meta/disconnect" =>
                    self.process_disconnect(message, output),
                "/meta/subscribe" =>
                    self.process_subscribe(message, output, conn),
                "/meta/unsubscribe" =>
                    self.process_unsubscribe(message, output),
                _ => {
                    *output = Value::String(
                        "Invalid meta channel".to_string());
                    MSG_ERROR
                }
            }
        } else {
            self.process_publish(channel, message, output)
        }
    }

    fn process_handshake(&self, output: &mut Value) -> i32 {
        // a fresh random 128-bit id, lower-case hex, no hyphens
        let client_id = format!("{:032x}", rand::random::<u128>());
        *output = json!({
            (FIELD_CHANNEL): "/meta/handshake",
            (FIELD_VERSION): "1.0",
            (FIELD_MINVERSION): "1.0",
            (FIELD_SUCCESSFUL): true,
            (FIELD_AUTHSUCCESSFUL): true,
            (FIELD_SUPPORTED_CONNTYPES):
                ["long-polling", "callback-polling", "iframe"],
            (FIELD_CLIENTID): client_id,
        });
        MSG_SEND
    }

    fn process_connect(&self, message: &Value, output: &mut Value)
        -> i32
    {
        let client_id = match required(message, FIELD_CLIENTID, output,
                                       "Client ID missing.")
        {
            Some(id) => id,
            None => return MSG_ERROR,
        };
        if required(message, FIELD_CONNTYPE, output,
                    "connectionType missing.").is_none()
        {
            return MSG_ERROR;
        }
        *output = json!({
            (FIELD_CHANNEL): "/meta/connect",
            (FIELD_SUCCESSFUL): true,
            (FIELD_CLIENTID): client_id,
        });
        MSG_SEND
    }

    fn process_disconnect(&self, message: &Value, output: &mut Value)
        -> i32
    {
        let client_id = match required(message, FIELD_CLIENTID, output,
                                       "Client ID missing.")
        {
            Some(id) => id,
            None => return MSG_ERROR,
        };
        self.remove_client(&client_id);
        *output = json!({
            (FIELD_CHANNEL): "/meta/disconnect",
            (FIELD_SUCCESSFUL): true,
            (FIELD_CLIENTID): client_id,
        });
        MSG_SEND
    }

    fn process_subscribe(&self, message: &Value, output: &mut Value,
                         conn: ConnId)
        -> i32
    {
        let client_id = match required(message, FIELD_CLIENTID, output,
                                       "Client ID missing.")
        {
            Some(id) => id,
            None => return MSG_ERROR,
        };
        let subscription = match required(message, FIELD_SUBSCRIPTION,
                                          output,
                                          "subscription missing.")
        {
            Some(name) => name,
            None => return MSG_ERROR,
        };
        let first_conn = self.add_client(&client_id, conn);
        let subscribed = self.add_subscription(&subscription,
                                               &client_id);
        *output = json!({
            (FIELD_CHANNEL): "/meta/subscribe",
            (FIELD_SUCCESSFUL): true,
            (FIELD_CLIENTID): client_id,
            (FIELD_SUBSCRIPTION): subscription,
            (FIELD_FIRSTCONN): first_conn,
            (FIELD_SUBSCRIBED): subscribed,
        });
        // the first connection is THE long living one, keep it open
        if first_conn { MSG_RETAIN } else { MSG_SEND }
    }

    fn process_unsubscribe(&self, message: &Value, output: &mut Value)
        -> i32
    {
        let client_id = match required(message, FIELD_CLIENTID, output,
                                       "Client ID missing.")
        {
            Some(id) => id,
            None => return MSG_ERROR,
        };
        let subscription = match required(message, FIELD_SUBSCRIPTION,
                                          output,
                                          "subscription missing.")
        {
            Some(name) => name,
            None => return MSG_ERROR,
        };
        self.remove_subscription(&subscription, &client_id);
        *output = json!({
            (FIELD_CHANNEL): "/meta/unsubscribe",
            (FIELD_SUCCESSFUL): true,
            (FIELD_CLIENTID): client_id,
            (FIELD_SUBSCRIPTION): subscription,
        });
        MSG_SEND
    }

    fn process_publish(&self, channel: &str, message: &Value,
                       output: &mut Value)
        -> i32
    {
        let registry = self.lock_registry();
        match registry.channels.get(channel) {
            Some(chan) => {
                *output = Value::String("OK".to_string());
                chan.handle_event(message, output);
                MSG_SEND
            }
            None => {
                *output = Value::String("Unknown channel".to_string());
                MSG_ERROR
            }
        }
    }

    fn send_response(&self, result: i32, output: &Value,
                     ctx: &ModuleCtx, request: &Arc<Request>)
    {
        let response = &request.response;
        if result < 0 {
            response.set_status(500, "Invalid Message");
        }
        if result <= 0 {
            let body = serde_json::to_vec(output)
                .expect("JSON value always serialises");
            response.with_headers(|h| {
                h.set_uint("Content-Length", body.len() as u64);
                h.set("Content-Type", "text/html");
            });
            ctx.send_output(self.id, &self.next,
                            Some(BodyPart::raw(body)));
            ctx.send_output(self.id, &self.next, Some(
                BodyPart::control(BodyKind::ContentFinished)));
        } else {
            response.with_headers(|h| {
                h.set("Content-Type",
                      &format!("multipart/x-mixed-replace;\
                                boundary=\"{}\"", self.boundary));
            });
            let channel = output.get(FIELD_SUBSCRIPTION)
                .and_then(Value::as_str)
                .unwrap_or("");
            let envelope = json!({
                (FIELD_CHANNEL): channel,
                (FIELD_DATA): output,
            });
            let first = serde_json::to_vec(&envelope)
                .expect("JSON value always serialises");
            // open the sub message, then the first fragment; no
            // content-finished: the connection stays retained
            ctx.send_output(self.id, &self.next, Some(
                BodyPart::control(BodyKind::OpenSubMessage(
                    self.boundary.clone()))));
            ctx.send_output(self.id, &self.next,
                            Some(BodyPart::raw(first)));
        }
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<Registry> {
        self.registry.lock().expect("bayeux registry poisoned")
    }
}

fn required(message: &Value, field: &str, output: &mut Value,
            missing: &str)
    -> Option<String>
{
    match message.get(field).and_then(Value::as_str) {
        Some(value) if !value.is_empty() => Some(value.to_string()),
        _ => {
            *output = Value::String(missing.to_string());
            None
        }
    }
}

impl HttpModule for BayeuxModule {
    fn module_id(&self) -> usize {
        self.id
    }

    fn next_module(&self) -> Option<&Arc<dyn HttpModule>> {
        Some(&self.next)
    }

    fn process_input(&self, ctx: &ModuleCtx, _body: Option<BodyPart>) {
        let request = match ctx.request() {
            Some(request) => request,
            None => return,
        };
        let mut output = Value::String(
            "<html><title>Error</title>\
             <body>Invalid bayeux message</body></html>".to_string());
        let mut result = MSG_ERROR;
        if let Some(bytes) = request.content_bytes() {
            match serde_json::from_slice::<Value>(bytes) {
                Ok(Value::Array(messages)) => {
                    for message in &messages {
                        result = self.process_message(message,
                                                      &mut output,
                                                      ctx.conn);
                        if result < 0 {
                            break;
                        }
                    }
                }
                Ok(message @ Value::Object(..)) => {
                    result = self.process_message(&message, &mut output,
                                                  ctx.conn);
                }
                Ok(_) => {
                    output = Value::String(
                        "Message must be an object or a list"
                            .to_string());
                }
                Err(e) => {
                    debug!("bad bayeux payload on {}: {}", ctx.conn, e);
                }
            }
        }
        self.send_response(result, &output, ctx, &request);
    }

    fn connection_closed(&self, conn: ConnId) {
        let dead: Vec<String> = {
            let registry = self.lock_registry();
            registry.clients.iter()
                .filter(|&(_, &c)| c == conn)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for client_id in dead {
            debug!("dropping bayeux client {} with connection {}",
                   client_id, conn);
            self.remove_client(&client_id);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use serde_json::{json, Value};

    use crate::connection::ConnId;
    use crate::http::module::{next_module_id, HttpModule};
    use super::{BayeuxModule, PlainChannel, MSG_ERROR, MSG_RETAIN,
                MSG_SEND};

    struct NullModule(usize);

    impl HttpModule for NullModule {
        fn module_id(&self) -> usize {
            self.0
        }
    }

    fn module() -> BayeuxModule {
        BayeuxModule::new(Arc::new(NullModule(next_module_id())),
                          "bayeuxbd")
    }

    fn process(m: &BayeuxModule, message: Value) -> (i32, Value) {
        let mut output = Value::Null;
        let result = m.process_message(&message, &mut output,
                                       ConnId(7));
        (result, output)
    }

    #[test]
    fn handshake_assigns_hex_client_id() {
        let m = module();
        let (result, output) =
            process(&m, json!({"channel": "/meta/handshake"}));
        assert_eq!(result, MSG_SEND);
        assert_eq!(output["successful"], json!(true));
        assert_eq!(output["authSuccessful"], json!(true));
        assert_eq!(output["supportedConnectionTypes"],
                   json!(["long-polling", "callback-polling",
                          "iframe"]));
        let id = output["clientId"].as_str().unwrap();
        assert_eq!(id.len(), 32);
        assert!(id.chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[test]
    fn handshake_ids_are_unique() {
        let m = module();
        let (_, a) = process(&m, json!({"channel": "/meta/handshake"}));
        let (_, b) = process(&m, json!({"channel": "/meta/handshake"}));
        assert!(a["clientId"] != b["clientId"]);
    }

    #[test]
    fn connect_requires_fields() {
        let m = module();
        let (result, output) =
            process(&m, json!({"channel": "/meta/connect"}));
        assert_eq!(result, MSG_ERROR);
        assert_eq!(output, json!("Client ID missing."));

        let (result, output) = process(&m, json!({
            "channel": "/meta/connect", "clientId": "abc"}));
        assert_eq!(result, MSG_ERROR);
        assert_eq!(output, json!("connectionType missing."));

        let (result, output) = process(&m, json!({
            "channel": "/meta/connect", "clientId": "abc",
            "connectionType": "long-polling"}));
        assert_eq!(result, MSG_SEND);
        assert_eq!(output["clientId"], json!("abc"));
        assert_eq!(output["successful"], json!(true));
    }

    #[test]
    fn first_subscribe_retains_the_connection() {
        let m = module();
        let (result, output) = process(&m, json!({
            "channel": "/meta/subscribe", "clientId": "c1",
            "subscription": "/quotes"}));
        assert_eq!(result, MSG_RETAIN);
        assert_eq!(output["firstconn"], json!(true));
        assert_eq!(output["subscribed"], json!(true));
        assert_eq!(output["subscription"], json!("/quotes"));

        // same client again: reply immediately, already connected
        let (result, output) = process(&m, json!({
            "channel": "/meta/subscribe", "clientId": "c1",
            "subscription": "/news"}));
        assert_eq!(result, MSG_SEND);
        assert_eq!(output["firstconn"], json!(false));
        assert_eq!(output["subscribed"], json!(true));
    }

    #[test]
    fn duplicate_subscription_reports_false() {
        let m = module();
        process(&m, json!({
            "channel": "/meta/subscribe", "clientId": "c1",
            "subscription": "/quotes"}));
        let (_, output) = process(&m, json!({
            "channel": "/meta/subscribe", "clientId": "c1",
            "subscription": "/quotes"}));
        assert_eq!(output["subscribed"], json!(false));
    }

    #[test]
    fn unsubscribe_removes_only_existing() {
        let m = module();
        process(&m, json!({
            "channel": "/meta/subscribe", "clientId": "c1",
            "subscription": "/quotes"}));
        let (result, output) = process(&m, json!({
            "channel": "/meta/unsubscribe", "clientId": "c1",
            "subscription": "/quotes"}));
        assert_eq!(result, MSG_SEND);
        assert_eq!(output["channel"], json!("/meta/unsubscribe"));
        // second removal finds nothing
        assert!(!m.remove_subscription("/quotes", "c1"));
        assert!(!m.remove_subscription("/missing", "c1"));
    }

    #[test]
    fn unknown_meta_channel_is_rejected() {
        let m = module();
        let (result, output) =
            process(&m, json!({"channel": "/meta/flush"}));
        assert_eq!(result, MSG_ERROR);
        assert_eq!(output, json!("Invalid meta channel"));
    }

    #[test]
    fn missing_channel_is_rejected() {
        let m = module();
        let (result, _) = process(&m, json!({"clientId": "x"}));
        assert_eq!(result, MSG_ERROR);
    }

    #[test]
    fn publish_reaches_registered_channel() {
        let m = module();
        assert!(m.register_channel(
            Box::new(PlainChannel::new("/quotes")), false));
        assert!(!m.register_channel(
            Box::new(PlainChannel::new("/quotes")), false));
        let (result, output) = process(&m, json!({
            "channel": "/quotes", "data": {"price": 100}}));
        assert_eq!(result, MSG_SEND);
        assert_eq!(output, json!("OK"));

        let (result, _) = process(&m, json!({"channel": "/elsewhere"}));
        assert_eq!(result, MSG_ERROR);
        assert!(m.unregister_channel("/quotes"));
        assert!(!m.unregister_channel("/quotes"));
    }

    #[test]
    fn json_values_round_trip() {
        let value = json!({
            "channel": "/quotes",
            "data": {"price": 100.5, "tags": ["a", "b"],
                     "nested": {"ok": true, "none": null}},
        });
        let text = serde_json::to_string(&value).unwrap();
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn closing_a_connection_forgets_its_clients() {
        let m = module();
        process(&m, json!({
            "channel": "/meta/subscribe", "clientId": "gone",
            "subscription": "/quotes"}));
        m.connection_closed(ConnId(7));
        // the id can connect afresh now
        let (result, output) = process(&m, json!({
            "channel": "/meta/subscribe", "clientId": "gone",
            "subscription": "/quotes"}));
        assert_eq!(result, MSG_RETAIN);
        assert_eq!(output["firstconn"], json!(true));
    }
}
