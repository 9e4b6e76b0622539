#![forbid(unsafe_code)]

//! Request construction by type name.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use ahash::AHashMap;
use planstate_core::Document;
use serde_json::Value;

use super::batch::{BATCH_REQUEST_TYPE, BatchRequest};
use super::request::{RequestError, RequestRef, RequestResult, request_ref};
use super::state_request::{STATE_REQUEST_TYPE, StateRequest};

/// Default number of undo steps kept per session.
pub const DEFAULT_MAX_UNDO_STEP: usize = 25;

/// Arguments handed to a request constructor.
#[derive(Debug, Clone, Default)]
pub enum RequestArgs {
    /// No arguments.
    #[default]
    None,
    /// Existing requests, e.g. the children of a batch.
    Requests(Vec<RequestRef>),
    /// Free-form JSON arguments.
    Value(Value),
}

/// What a session needs from its owner.
pub trait RequestFactory {
    /// History bound applied when a session has no override.
    fn max_undo_step(&self) -> usize;

    /// Build a request of a registered type.
    fn create_request(&self, request_type: &str, args: RequestArgs) -> RequestResult<RequestRef>;
}

/// Builds a request from its arguments.
pub type RequestConstructor = Rc<dyn Fn(RequestArgs) -> RequestResult<RequestRef>>;

/// Rewrites arguments before they reach the constructor.
pub type ArgsAdapter = Rc<dyn Fn(RequestArgs) -> RequestArgs>;

struct Registration {
    constructor: RequestConstructor,
    adapter: Option<ArgsAdapter>,
}

/// Type name → constructor table.
///
/// `"Batch"` is always registered. Requests built through the registry get
/// their registered type name stamped into their metadata.
pub struct RequestRegistry {
    entries: RefCell<AHashMap<String, Registration>>,
    max_undo_step: Cell<usize>,
}

impl fmt::Debug for RequestRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestRegistry")
            .field("types", &self.request_types())
            .field("max_undo_step", &self.max_undo_step.get())
            .finish()
    }
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UNDO_STEP)
    }
}

impl RequestRegistry {
    /// Registry with the batch type and the given history bound.
    #[must_use]
    pub fn new(max_undo_step: usize) -> Self {
        let registry = Self {
            entries: RefCell::new(AHashMap::new()),
            max_undo_step: Cell::new(max_undo_step),
        };
        registry.register(BATCH_REQUEST_TYPE, |args| match args {
            RequestArgs::Requests(children) => Ok(request_ref(BatchRequest::new(children))),
            _ => Ok(request_ref(BatchRequest::new(Vec::new()))),
        });
        registry
    }

    /// Register (or replace) a constructor.
    pub fn register<F>(&self, request_type: impl Into<String>, constructor: F)
    where
        F: Fn(RequestArgs) -> RequestResult<RequestRef> + 'static,
    {
        self.entries.borrow_mut().insert(
            request_type.into(),
            Registration {
                constructor: Rc::new(constructor),
                adapter: None,
            },
        );
    }

    /// Register a constructor whose arguments pass through `adapter` first.
    pub fn register_with_adapter<F, A>(&self, request_type: impl Into<String>, constructor: F, adapter: A)
    where
        F: Fn(RequestArgs) -> RequestResult<RequestRef> + 'static,
        A: Fn(RequestArgs) -> RequestArgs + 'static,
    {
        self.entries.borrow_mut().insert(
            request_type.into(),
            Registration {
                constructor: Rc::new(constructor),
                adapter: Some(Rc::new(adapter)),
            },
        );
    }

    /// Register `"State"` requests recording changes to `document`.
    ///
    /// A string argument becomes the request description.
    pub fn register_state_requests(&self, document: Rc<Document>) {
        self.register(STATE_REQUEST_TYPE, move |args| {
            let request = StateRequest::new(Rc::clone(&document));
            Ok(request_ref(match args {
                RequestArgs::Value(Value::String(description)) => {
                    request.with_description(description)
                }
                _ => request,
            }))
        });
    }

    /// Whether `request_type` is registered.
    #[must_use]
    pub fn contains(&self, request_type: &str) -> bool {
        self.entries.borrow().contains_key(request_type)
    }

    /// Registered type names, sorted.
    #[must_use]
    pub fn request_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.entries.borrow().keys().cloned().collect();
        types.sort();
        types
    }

    /// Change the default history bound.
    pub fn set_max_undo_step(&self, max_undo_step: usize) {
        self.max_undo_step.set(max_undo_step);
    }
}

impl RequestFactory for RequestRegistry {
    fn max_undo_step(&self) -> usize {
        self.max_undo_step.get()
    }

    fn create_request(&self, request_type: &str, args: RequestArgs) -> RequestResult<RequestRef> {
        let (constructor, adapter) = {
            let entries = self.entries.borrow();
            let entry = entries
                .get(request_type)
                .ok_or_else(|| RequestError::UnknownType(request_type.to_owned()))?;
            (Rc::clone(&entry.constructor), entry.adapter.clone())
        };
        let args = match adapter {
            Some(adapter) => adapter(args),
            None => args,
        };
        let request = constructor(args)?;
        request.borrow_mut().meta_mut().request_type = request_type.to_owned();
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::undo::request::{CallbackRequest, RequestState};

    #[test]
    fn batch_is_always_registered() {
        let registry = RequestRegistry::default();
        assert!(registry.contains("Batch"));
        assert_eq!(registry.max_undo_step(), DEFAULT_MAX_UNDO_STEP);
        let batch = registry.create_request("Batch", RequestArgs::None).unwrap();
        assert!(batch.borrow().as_batch().is_some());
    }

    #[test]
    fn unknown_type_is_an_error() {
        let registry = RequestRegistry::new(3);
        let err = registry.create_request("Nope", RequestArgs::None).unwrap_err();
        assert_eq!(err, RequestError::UnknownType("Nope".into()));
    }

    #[test]
    fn registered_name_is_stamped() {
        let registry = RequestRegistry::default();
        registry.register("MoveWall", |_| {
            Ok(request_ref(CallbackRequest::new("generic", || Ok(()), || Ok(()))))
        });
        let req = registry.create_request("MoveWall", RequestArgs::None).unwrap();
        assert_eq!(req.borrow().request_type(), "MoveWall");
        assert_eq!(req.borrow().state(), RequestState::Open);
    }

    #[test]
    fn state_requests_take_a_description() {
        let registry = RequestRegistry::default();
        let document = Rc::new(Document::new(Rc::new(planstate_core::EntityRegistry::new())));
        registry.register_state_requests(document);
        let req = registry
            .create_request("State", RequestArgs::Value(Value::from("Move wall")))
            .unwrap();
        assert_eq!(req.borrow().description(), "Move wall");
        assert!(req.borrow().as_any().is::<StateRequest>());
    }

    #[test]
    fn adapter_rewrites_arguments() {
        let registry = RequestRegistry::default();
        registry.register_with_adapter(
            "Labelled",
            |args| {
                let label = match args {
                    RequestArgs::Value(Value::String(s)) => s,
                    _ => "none".to_owned(),
                };
                Ok(request_ref(
                    CallbackRequest::new("Labelled", || Ok(()), || Ok(())).with_description(label),
                ))
            },
            |args| match args {
                RequestArgs::None => RequestArgs::Value(Value::from("defaulted")),
                other => other,
            },
        );
        let req = registry.create_request("Labelled", RequestArgs::None).unwrap();
        assert_eq!(req.borrow().description(), "defaulted");
        assert_eq!(registry.request_types(), ["Batch", "Labelled"]);
    }
}
