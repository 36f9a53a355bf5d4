//! Module for routing to other modules based on URLs.

use std::sync::Arc;

use crate::enums::Status;
use crate::http::body::{BodyKind, BodyPart};
use crate::http::error_page::error_page;
use crate::http::module::{next_module_id, HttpModule, ModuleCtx};

/// Decides whether a route applies to a resource path.
pub trait UrlMatcher: Send + Sync + 'static {
    fn matches(&self, resource: &str) -> bool;
}

/// Exact match on the whole resource.
pub struct EqualsMatcher(pub String);

impl UrlMatcher for EqualsMatcher {
    fn matches(&self, resource: &str) -> bool {
        resource == self.0
    }
}

/// Where a [`ContainsMatcher`] pattern must sit in the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchLocation {
    Prefix,
    Suffix,
    Anywhere,
}

/// Substring match anchored at the start, the end, or nowhere.
pub struct ContainsMatcher {
    pattern: String,
    location: MatchLocation,
}

impl ContainsMatcher {
    pub fn new(pattern: &str, location: MatchLocation)
        -> ContainsMatcher
    {
        ContainsMatcher {
            pattern: pattern.to_string(),
            location: location,
        }
    }

    pub fn prefix(pattern: &str) -> ContainsMatcher {
        ContainsMatcher::new(pattern, MatchLocation::Prefix)
    }

    pub fn suffix(pattern: &str) -> ContainsMatcher {
        ContainsMatcher::new(pattern, MatchLocation::Suffix)
    }
}

impl UrlMatcher for ContainsMatcher {
    fn matches(&self, resource: &str) -> bool {
        match self.location {
            MatchLocation::Prefix => resource.starts_with(&self.pattern),
            MatchLocation::Suffix => resource.ends_with(&self.pattern),
            MatchLocation::Anywhere => resource.contains(&self.pattern),
        }
    }
}

/// Placeholder for pattern matching; always declines.
// TODO(routing) back this with a real regex engine if a route ever
// needs one
pub struct RegexMatcher(pub String);

impl UrlMatcher for RegexMatcher {
    fn matches(&self, _resource: &str) -> bool {
        false
    }
}

/// Routes a request to the first module whose matcher accepts the
/// resource; unmatched requests fall through to `fallback` or get a
/// 404 sent down the output chain.
pub struct UrlRouter {
    id: usize,
    routes: Vec<(Box<dyn UrlMatcher>, Arc<dyn HttpModule>)>,
    fallback: Option<Arc<dyn HttpModule>>,
    out: Arc<dyn HttpModule>,
}

impl UrlRouter {
    pub fn new(out: Arc<dyn HttpModule>) -> UrlRouter {
        UrlRouter {
            id: next_module_id(),
            routes: Vec::new(),
            fallback: None,
            out: out,
        }
    }

    pub fn route(mut self, matcher: Box<dyn UrlMatcher>,
                 module: Arc<dyn HttpModule>)
        -> UrlRouter
    {
        self.routes.push((matcher, module));
        self
    }

    pub fn fallback(mut self, module: Arc<dyn HttpModule>) -> UrlRouter {
        self.fallback = Some(module);
        self
    }

    fn not_found(&self, ctx: &ModuleCtx) {
        let request = match ctx.request() {
            Some(request) => request,
            None => return,
        };
        let body = error_page(Status::NotFound.code(),
                              Status::NotFound.reason());
        let response = &request.response;
        response.set_status_std(Status::NotFound);
        response.with_headers(|h| {
            h.set("Content-Type", "text/html");
            h.set_uint("Content-Length", body.len() as u64);
        });
        ctx.send_output(self.id, &self.out,
                        Some(BodyPart::raw(body)));
        ctx.send_output(self.id, &self.out,
                        Some(BodyPart::control(BodyKind::ContentFinished)));
    }
}

impl HttpModule for UrlRouter {
    fn module_id(&self) -> usize {
        self.id
    }

    fn process_input(&self, ctx: &ModuleCtx, body: Option<BodyPart>) {
        let resource = match ctx.request() {
            Some(request) => request.resource.clone(),
            None => return,
        };
        for &(ref matcher, ref module) in &self.routes {
            if matcher.matches(&resource) {
                ctx.send_input(self.id, module, body);
                return;
            }
        }
        match self.fallback {
            Some(ref module) => ctx.send_input(self.id, module, body),
            None => {
                debug!("no route for {:?}", resource);
                self.not_found(ctx);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{ContainsMatcher, EqualsMatcher, MatchLocation,
                RegexMatcher, UrlMatcher};

    #[test]
    fn equals() {
        let m = EqualsMatcher("/exact".to_string());
        assert!(m.matches("/exact"));
        assert!(!m.matches("/exact/"));
        assert!(!m.matches("/other"));
    }

    #[test]
    fn prefix() {
        let m = ContainsMatcher::prefix("/static/");
        assert!(m.matches("/static/css/site.css"));
        assert!(!m.matches("/api/static/"));
    }

    #[test]
    fn suffix() {
        let m = ContainsMatcher::suffix(".html");
        assert!(m.matches("/index.html"));
        assert!(!m.matches("/index.html.bak"));
    }

    #[test]
    fn anywhere() {
        let m = ContainsMatcher::new("admin", MatchLocation::Anywhere);
        assert!(m.matches("/x/admin/y"));
        assert!(!m.matches("/public"));
    }

    #[test]
    fn regex_declines() {
        let m = RegexMatcher(".*".to_string());
        assert!(!m.matches("/anything"));
    }
}
