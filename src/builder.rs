//! Wiring: builds the stages, chains the modules and runs the server
//! loop on its own thread.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::bayeux::{BayeuxModule, Channel};
use crate::config::Config;
use crate::connection::ConnId;
use crate::http::content::ContentModule;
use crate::http::file::FileModule;
use crate::http::handler::{HandlerCore, HandlerStage};
use crate::http::mime::MimeTypes;
use crate::http::module::HttpModule;
use crate::http::reader::{ReaderCore, ReaderStage};
use crate::http::router::{ContainsMatcher, UrlRouter};
use crate::http::transfer::TransferModule;
use crate::http::writer::{WriterCore, WriterModule, WriterStage};
use crate::server::{ConnTable, Server};
use crate::stage::Stage;

/// Assembles the default module chain:
/// router -> (bayeux | files) -> content -> transfer -> writer.
pub struct ServerBuilder {
    config: Config,
    docroots: Vec<(String, PathBuf)>,
    bayeux_at: Option<String>,
    boundary: String,
    channels: Vec<Box<dyn Channel>>,
    mime: Option<MimeTypes>,
}

impl ServerBuilder {
    pub fn new(config: Config) -> ServerBuilder {
        ServerBuilder {
            config: config,
            docroots: Vec::new(),
            bayeux_at: None,
            boundary: "seda-http-boundary".to_string(),
            channels: Vec::new(),
            mime: None,
        }
    }

    /// Serve files under `docroot` for resources under `prefix`.
    pub fn docroot(mut self, prefix: &str, docroot: PathBuf)
        -> ServerBuilder
    {
        self.docroots.push((prefix.to_string(), docroot));
        self
    }

    /// Mount the Bayeux module for resources under `prefix`.
    pub fn bayeux(mut self, prefix: &str) -> ServerBuilder {
        self.bayeux_at = Some(prefix.to_string());
        self
    }

    pub fn boundary(mut self, boundary: &str) -> ServerBuilder {
        self.boundary = boundary.to_string();
        self
    }

    pub fn channel(mut self, channel: Box<dyn Channel>)
        -> ServerBuilder
    {
        self.channels.push(channel);
        self
    }

    pub fn mime_table(mut self, mime: MimeTypes) -> ServerBuilder {
        self.mime = Some(mime);
        self
    }

    /// Bind, wire and start everything.
    pub fn start(self) -> io::Result<HttpServer> {
        let config = self.config.clone();
        let (poll, listener, addr, conns) = Server::bind(&config)?;

        let writer: Arc<WriterStage> = Stage::new(
            "http-writer", WriterCore::new(conns.clone()),
            config.writer_threads);

        // output chain, tail first
        let sink: Arc<dyn HttpModule> = Arc::new(WriterModule::new());
        let transfer: Arc<dyn HttpModule> =
            Arc::new(TransferModule::new(sink.clone()));
        let content: Arc<dyn HttpModule> =
            Arc::new(ContentModule::new(transfer.clone()));

        let mime = Arc::new(match self.mime {
            Some(mime) => mime,
            None => MimeTypes::system(),
        });
        let mut router = UrlRouter::new(content.clone());

        let bayeux = match self.bayeux_at {
            Some(ref prefix) => {
                let module = Arc::new(BayeuxModule::new(content.clone(),
                                                        &self.boundary));
                for channel in self.channels {
                    module.register_channel(channel, true);
                }
                let routed: Arc<dyn HttpModule> = module.clone();
                router = router.route(
                    Box::new(ContainsMatcher::prefix(prefix)), routed);
                Some(module)
            }
            None => None,
        };

        if !self.docroots.is_empty() {
            let mut files = FileModule::new(content.clone(),
                                            mime.clone());
            for (prefix, docroot) in self.docroots {
                files = files.docroot(&prefix, docroot);
            }
            router = router.fallback(Arc::new(files));
        }

        let root: Arc<dyn HttpModule> = Arc::new(router);
        let modules: Vec<Arc<dyn HttpModule>> = {
            let mut all = vec![root.clone(), content.clone(),
                               transfer.clone(), sink.clone()];
            if let Some(ref module) = bayeux {
                let module: Arc<dyn HttpModule> = module.clone();
                all.push(module);
            }
            all
        };
        conns.on_close(Box::new(move |id: ConnId| {
            for module in &modules {
                module.connection_closed(id);
            }
        }));

        let handler: Arc<HandlerStage> = Stage::new(
            "http-handler",
            HandlerCore::new(conns.clone(), writer.clone(), root),
            config.handler_threads);
        handler.handler().bind(&handler);
        if let Some(ref module) = bayeux {
            module.bind_handler(&handler);
        }

        let reader: Arc<ReaderStage> = Stage::new(
            "http-reader",
            ReaderCore::new(conns.clone(), handler.clone(),
                            config.read_chunk),
            config.reader_threads);

        let mut server = Server::new(config, poll, listener, addr,
                                     conns.clone(), reader.clone(),
                                     writer.clone());
        let stop = server.stop_flag();

        reader.start();
        handler.start();
        writer.start();
        let thread = std::thread::Builder::new()
            .name("http-server".to_string())
            .spawn(move || server.run())?;

        Ok(HttpServer {
            addr: addr,
            conns: conns,
            reader: reader,
            handler: handler,
            writer: writer,
            bayeux: bayeux,
            stop: stop,
            thread: Some(thread),
        })
    }
}

/// A running server; dropping it shuts everything down.
pub struct HttpServer {
    addr: SocketAddr,
    conns: Arc<ConnTable>,
    reader: Arc<ReaderStage>,
    handler: Arc<HandlerStage>,
    writer: Arc<WriterStage>,
    bayeux: Option<Arc<BayeuxModule>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<io::Result<()>>>,
}

impl HttpServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The mounted Bayeux module, for `deliver_event` and channel
    /// registration at runtime.
    pub fn bayeux(&self) -> Option<&Arc<BayeuxModule>> {
        self.bayeux.as_ref()
    }

    pub fn connections(&self) -> usize {
        self.conns.count()
    }

    /// Stop the accept loop and all stage workers. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            match thread.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("server loop failed: {}", e),
                Err(_) => error!("server thread panicked"),
            }
        }
        self.reader.stop();
        self.handler.stop();
        self.writer.stop();
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.stop();
    }
}
