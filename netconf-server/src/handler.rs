//! RPC dispatch.
//!
//! Each `<rpc>` goes through `validated → executed → filtered → replied`.
//! Operation handlers are looked up by the operation element's local name
//! in the session's negotiated capability registry.

use crate::datastore::{DatastoreSession, RpcOutput};
use crate::error::{HandlerError, ServerError};
use crate::metrics::Metrics;
use crate::server::Server;
use crate::session::Session;
use netconf_core::filter::{self, Filter};
use netconf_core::{CapabilityRegistry, XPATH_KEYWORD};
use netconf_protocol::xml::Element;
use netconf_protocol::{build_reply, ReplyContent, RpcError};
use std::fmt;
use std::sync::Arc;

/// Signature of an operation handler.
pub type OperationFn =
    dyn Fn(&mut OperationContext<'_>, &Element) -> Result<RpcOutput, HandlerError> + Send + Sync;

/// An operation registered on a capability.
#[derive(Clone)]
pub struct OperationSpec {
    handler: Arc<OperationFn>,
    accepts_filter: bool,
}

impl OperationSpec {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&mut OperationContext<'_>, &Element) -> Result<RpcOutput, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            handler: Arc::new(handler),
            accepts_filter: false,
        }
    }

    /// Marks the operation as taking a `<filter>` applied to its output.
    pub fn with_filter(mut self) -> Self {
        self.accepts_filter = true;
        self
    }

    pub fn accepts_filter(&self) -> bool {
        self.accepts_filter
    }

    pub fn call(&self, ctx: &mut OperationContext<'_>, input: &Element) -> Result<RpcOutput, HandlerError> {
        (self.handler)(ctx, input)
    }
}

impl fmt::Debug for OperationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationSpec")
            .field("accepts_filter", &self.accepts_filter)
            .finish_non_exhaustive()
    }
}

/// Capability registry carrying operation handlers.
pub type OperationRegistry = CapabilityRegistry<OperationSpec>;

/// Session teardown requested by a successful operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Close the session that sent the request.
    Own,
    /// Close another session.
    Session(u32),
}

/// What a handler can reach while it runs.
pub struct OperationContext<'a> {
    pub server: &'a Arc<Server>,
    pub session: &'a Arc<Session>,
    pub negotiated: &'a OperationRegistry,
    datastore: &'a mut Option<Box<dyn DatastoreSession>>,
    teardown: Option<Teardown>,
}

impl<'a> OperationContext<'a> {
    pub fn new(
        server: &'a Arc<Server>,
        session: &'a Arc<Session>,
        negotiated: &'a OperationRegistry,
        datastore: &'a mut Option<Box<dyn DatastoreSession>>,
    ) -> Self {
        Self {
            server,
            session,
            negotiated,
            datastore,
            teardown: None,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session.id()
    }

    /// Forwards an operation to the session's datastore handle, or to the
    /// server's datastore when the session has none.
    pub fn datastore(&mut self, operation: &str, input: &Element) -> Result<RpcOutput, HandlerError> {
        match self.datastore.as_mut() {
            Some(handle) => handle.handle(operation, input),
            None => self.server.datastore().handle(operation, input),
        }
    }

    /// Requests teardown once the reply has been sent.
    pub fn request_teardown(&mut self, teardown: Teardown) {
        self.teardown = Some(teardown);
    }

    pub fn take_teardown(&mut self) -> Option<Teardown> {
        self.teardown.take()
    }
}

/// Turns `<rpc>` elements into `<rpc-reply>` elements.
#[derive(Default)]
pub struct Dispatcher {
    metrics: Option<Arc<Metrics>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Handles one `<rpc>` and builds its reply. Every attribute of the
    /// request, `message-id` included, is echoed on the reply.
    ///
    /// Protocol errors become `<rpc-error>` replies. `HandlerError::Fatal`
    /// is returned as an error and ends the session.
    pub fn dispatch(&self, ctx: &mut OperationContext<'_>, rpc: &Element) -> Result<Element, ServerError> {
        let op_name = rpc.children.first().map(|op| op.name.as_str()).unwrap_or("none");
        let timer = self
            .metrics
            .as_ref()
            .map(|m| m.rpc_duration.with_label_values(&[op_name]).start_timer());

        let result = Self::execute(ctx, rpc);

        if let Some(ref metrics) = self.metrics {
            metrics.rpcs_total.with_label_values(&[op_name]).inc();
            if let Err(HandlerError::Rpc(ref e)) = result {
                metrics.rpc_errors_total.with_label_values(&[e.tag.as_str()]).inc();
            }
        }
        drop(timer);

        let content = match result {
            Ok(content) => content,
            Err(HandlerError::Rpc(e)) => {
                tracing::debug!("rpc {} failed: {}", op_name, e);
                ctx.take_teardown();
                ReplyContent::Errors(vec![e])
            }
            Err(HandlerError::Fatal(msg)) => {
                tracing::error!("rpc {} failed fatally: {}", op_name, msg);
                ctx.take_teardown();
                return Err(ServerError::Handler(msg));
            }
        };
        Ok(build_reply(&rpc.attributes, content))
    }

    fn execute(ctx: &mut OperationContext<'_>, rpc: &Element) -> Result<ReplyContent, HandlerError> {
        if rpc.attr("message-id").is_none() {
            return Err(RpcError::missing_attribute("message-id", "rpc").into());
        }
        let input = rpc
            .children
            .first()
            .ok_or_else(|| RpcError::missing_element("operation"))?;
        let spec = ctx
            .negotiated
            .find_operation(&input.name)
            .cloned()
            .ok_or_else(|| RpcError::operation_not_supported(&input.name))?;

        let filter = if spec.accepts_filter() {
            Self::parse_filter(ctx.negotiated, rpc, input)?
        } else {
            None
        };

        let output = match spec.call(ctx, input)? {
            RpcOutput::Ok => return Ok(ReplyContent::Ok),
            RpcOutput::Xml(xml) => Element::parse(&xml).map_err(|e| {
                RpcError::operation_failed(format!("operation produced invalid XML: {}", e))
            })?,
            RpcOutput::Tree(tree) => tree,
        };
        Ok(ReplyContent::Data(filter::apply(output, filter.as_ref())?))
    }

    fn parse_filter(
        negotiated: &OperationRegistry,
        rpc: &Element,
        input: &Element,
    ) -> Result<Option<Filter>, RpcError> {
        let Some(element) = input.child("filter") else {
            return Ok(None);
        };
        let mut scope = rpc.ns_decls.clone();
        scope.extend(input.ns_decls.iter().cloned());
        let filter = Filter::from_element(element, &scope)?;
        if filter.is_xpath() && !negotiated.contains_keyword(XPATH_KEYWORD) {
            return Err(RpcError::operation_not_supported("xpath filter")
                .with_message("the :xpath capability was not negotiated"));
        }
        Ok(Some(filter))
    }
}
