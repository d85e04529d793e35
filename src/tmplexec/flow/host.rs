//! The narrow surface a flow script sees: invoke a request, write the scan
//! context, log. Scripts are JavaScript evaluated by `boa_engine` on a
//! blocking thread; they reach the async engine only through [`ChannelHost`].

use boa_engine::object::builtins::JsArray;
use boa_engine::{js_string, Context as JsContext, JsError, JsNativeError, JsResult, JsString, JsValue, NativeFunction, Source};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::dsl::{self, functions};
use crate::errors::TemplarError;
use crate::protocols::{Context, ProtocolType};

/// Script function names that invoke protocol requests.
pub const PROTOCOL_FUNCTIONS: &[&str] = &["http", "dns", "network", "tcp"];

/// Loop iterations a single script may run before it is aborted.
const LOOP_ITERATION_LIMIT: u64 = 1_000_000;

/// Which requests a protocol call in a script addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// `http()`: every request of the protocol, in declared order.
    All(ProtocolType),
    /// `http(2)`: the n-th request of the protocol, counting from 1.
    Index(ProtocolType, usize),
    /// `http("login")`: the request with that id.
    Id(ProtocolType, String),
}

impl Selector {
    /// Protocol type a script function name invokes, if any.
    pub fn protocol_of(function: &str) -> Option<ProtocolType> {
        PROTOCOL_FUNCTIONS
            .contains(&function)
            .then(|| ProtocolType::from_template_key(function))
            .flatten()
    }

    /// Selector for a call to `function(args)`, or `None` when `function`
    /// is not a protocol invocation.
    pub fn from_call(function: &str, args: &[Value]) -> Option<Result<Self, TemplarError>> {
        let protocol = Self::protocol_of(function)?;
        let selector = match args.first() {
            None | Some(Value::Null) => Ok(Selector::All(protocol)),
            Some(Value::String(id)) => Ok(Selector::Id(protocol, id.clone())),
            Some(other) => dsl::as_number(other)
                .filter(|n| *n >= 1.0 && n.fract() == 0.0)
                .map(|n| Selector::Index(protocol, n as usize))
                .ok_or_else(|| {
                    TemplarError::Flow(format!("{}() expects a request index or id, got {}", function, other))
                }),
        };
        Some(selector)
    }

    pub fn protocol(&self) -> ProtocolType {
        match self {
            Selector::All(p) | Selector::Index(p, _) | Selector::Id(p, _) => *p,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::All(p) => write!(f, "{}()", p),
            Selector::Index(p, n) => write!(f, "{}({})", p, n),
            Selector::Id(p, id) => write!(f, "{}(\"{}\")", p, id),
        }
    }
}

/// Operations the engine exposes to a flow script.
pub trait FlowHost {
    /// Run the selected requests to completion. Returns whether they matched.
    fn invoke(&mut self, selector: Selector) -> Result<bool, TemplarError>;

    fn set(&mut self, key: String, value: Value);

    /// Every value in the scan context, exposed to scripts as `template`.
    fn snapshot(&self) -> Map<String, Value>;

    fn log(&self, value: &Value) {
        info!(value = %dsl::to_text(value), "flow log");
    }
}

/// An invocation waiting for the engine to execute it.
pub struct Invocation {
    pub selector: Selector,
    pub reply: oneshot::Sender<Result<bool, TemplarError>>,
}

/// [`FlowHost`] for a script running on a blocking thread. Invocations are
/// sent to the engine task and block until it replies; context access goes
/// straight to the scan context, which nobody else writes while the script
/// waits.
pub struct ChannelHost {
    ctx: Context,
    sender: mpsc::Sender<Invocation>,
    template_id: String,
}

impl ChannelHost {
    pub fn new(ctx: Context, sender: mpsc::Sender<Invocation>, template_id: impl Into<String>) -> Self {
        Self { ctx, sender, template_id: template_id.into() }
    }
}

impl FlowHost for ChannelHost {
    fn invoke(&mut self, selector: Selector) -> Result<bool, TemplarError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .blocking_send(Invocation { selector, reply })
            .map_err(|_| TemplarError::Flow("flow engine stopped".into()))?;
        response
            .blocking_recv()
            .map_err(|_| TemplarError::Cancelled("flow invocation dropped".into()))?
    }

    fn set(&mut self, key: String, value: Value) {
        self.ctx.set(key, value);
    }

    fn snapshot(&self) -> Map<String, Value> {
        self.ctx.all()
    }

    fn log(&self, value: &Value) {
        info!(template_id = %self.template_id, value = %dsl::to_text(value), "flow log");
    }
}

/// Check a script for syntax errors without running it.
pub fn check_syntax(source: &str) -> Result<(), TemplarError> {
    let mut context = JsContext::default();
    boa_engine::Script::parse(Source::from_bytes(source), None, &mut context)
        .map(|_| ())
        .map_err(|e| TemplarError::Compile(e.to_string()))
}

/// A JavaScript context wired to a [`FlowHost`]. Protocol functions, `set`,
/// `log` and `iterate` are globals; `template` is an object mirroring the
/// scan context and refreshed after every call that can change it.
pub struct FlowEnv<H> {
    host: Rc<RefCell<H>>,
    context: JsContext,
}

impl<H: FlowHost + 'static> FlowEnv<H> {
    pub fn new(host: H) -> Result<Self, TemplarError> {
        let host = Rc::new(RefCell::new(host));
        let mut context = JsContext::default();
        context.runtime_limits_mut().set_loop_iteration_limit(LOOP_ITERATION_LIMIT);

        for &name in PROTOCOL_FUNCTIONS {
            let shared = Rc::clone(&host);
            // SAFETY: the closure captures only a host handle and a static
            // name, neither of which holds garbage-collected values.
            let function = unsafe {
                NativeFunction::from_closure(move |_, args, ctx| {
                    let args = args.iter().map(|a| to_json(a, ctx)).collect::<JsResult<Vec<_>>>()?;
                    let selector = Selector::from_call(name, &args)
                        .unwrap_or_else(|| Err(TemplarError::Flow(format!("{}() is not a protocol", name))))
                        .map_err(host_error)?;
                    let matched = shared.borrow_mut().invoke(selector).map_err(host_error)?;
                    refresh_template(&shared, ctx)?;
                    Ok(JsValue::from(matched))
                })
            };
            register(&mut context, name, 1, function)?;
        }

        let shared = Rc::clone(&host);
        // SAFETY: captures only the host handle.
        let set = unsafe {
            NativeFunction::from_closure(move |_, args, ctx| {
                let key = match args.first() {
                    Some(key) => key.to_string(ctx)?.to_std_string_escaped(),
                    None => return Err(JsNativeError::typ().with_message("set() expects a key and a value").into()),
                };
                let value = to_json(args.get(1).unwrap_or(&JsValue::undefined()), ctx)?;
                shared.borrow_mut().set(key, value);
                refresh_template(&shared, ctx)?;
                Ok(JsValue::undefined())
            })
        };
        register(&mut context, "set", 2, set)?;

        let shared = Rc::clone(&host);
        // SAFETY: captures only the host handle.
        let log = unsafe {
            NativeFunction::from_closure(move |_, args, ctx| {
                for arg in args {
                    let value = to_json(arg, ctx)?;
                    shared.borrow().log(&value);
                }
                Ok(JsValue::undefined())
            })
        };
        register(&mut context, "log", 1, log)?;

        register(&mut context, "iterate", 1, NativeFunction::from_fn_ptr(iterate))?;

        refresh_template(&host, &mut context).map_err(|e| TemplarError::Flow(e.to_string()))?;
        Ok(Self { host, context })
    }

    /// Evaluate `source` and return its completion value.
    pub fn run(&mut self, source: &str) -> Result<Value, TemplarError> {
        let value = self
            .context
            .eval(Source::from_bytes(source))
            .map_err(|e| TemplarError::Flow(e.to_string()))?;
        to_json(&value, &mut self.context).map_err(|e| TemplarError::Flow(e.to_string()))
    }

    pub fn host(&self) -> std::cell::Ref<'_, H> {
        self.host.borrow()
    }
}

fn register(context: &mut JsContext, name: &str, length: usize, function: NativeFunction) -> Result<(), TemplarError> {
    context
        .register_global_callable(JsString::from(name), length, function)
        .map_err(|e| TemplarError::Internal(format!("registering {}(): {}", name, e)))
}

fn refresh_template<H: FlowHost>(host: &Rc<RefCell<H>>, ctx: &mut JsContext) -> JsResult<()> {
    let snapshot = Value::Object(host.borrow().snapshot());
    let template = JsValue::from_json(&snapshot, ctx)?;
    ctx.global_object().set(js_string!("template"), template, true, ctx)?;
    Ok(())
}

/// `iterate(a, b, ...)`: one flat array of every non-null argument.
fn iterate(_: &JsValue, args: &[JsValue], ctx: &mut JsContext) -> JsResult<JsValue> {
    let values = args.iter().map(|a| to_json(a, ctx)).collect::<JsResult<Vec<_>>>()?;
    let flat = functions::call("iterate", &values).map_err(|e| JsNativeError::typ().with_message(e.to_string()))?;
    match flat {
        Value::Array(items) => {
            let items = items.iter().map(|v| JsValue::from_json(v, ctx)).collect::<JsResult<Vec<_>>>()?;
            Ok(JsArray::from_iter(items, ctx).into())
        }
        other => JsValue::from_json(&other, ctx),
    }
}

fn to_json(value: &JsValue, ctx: &mut JsContext) -> JsResult<Value> {
    if value.is_undefined() || value.is_null() || value.is_callable() {
        return Ok(Value::Null);
    }
    value.to_json(ctx)
}

fn host_error(error: TemplarError) -> JsError {
    JsNativeError::error().with_message(error.to_string()).into()
}
