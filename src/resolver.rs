use std::collections::HashMap;
use std::sync::Arc;

use crate::descriptor::{HandlerDescriptor, TaskId};
use crate::error::TaskResult;
use crate::value::Value;

/// Recovers from the failure of a task body.
///
/// Returning `Ok` substitutes the failed task's result, `Ok(None)` meaning the
/// task produced nothing. Returning `Err` makes the failure fatal for the
/// whole startup run.
pub trait ExceptionHandler: Send {
    fn handle(&self, id: &TaskId, error: anyhow::Error) -> TaskResult<Option<Value>>;
}

impl<F> ExceptionHandler for F
where
    F: Fn(&TaskId, anyhow::Error) -> TaskResult<Option<Value>> + Send,
{
    fn handle(&self, id: &TaskId, error: anyhow::Error) -> TaskResult<Option<Value>> {
        (self)(id, error)
    }
}

/// Default handler, propagates every failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rethrow;

impl ExceptionHandler for Rethrow {
    fn handle(&self, _: &TaskId, error: anyhow::Error) -> TaskResult<Option<Value>> {
        Err(error)
    }
}

pub(crate) type DefaultHandler = Arc<dyn ExceptionHandler + Sync>;

/// Picks the handler protecting a failed task.
pub(crate) struct Resolver {
    handlers: HashMap<TaskId, HandlerDescriptor>,
    default: DefaultHandler,
}

impl Resolver {
    pub fn new(handlers: HashMap<TaskId, HandlerDescriptor>, default: DefaultHandler) -> Self {
        Self { handlers, default }
    }

    /// Runs the registered handler for `id`, or the default one.
    pub fn resolve(&self, id: &TaskId, error: anyhow::Error) -> TaskResult<Option<Value>> {
        match self.handlers.get(id) {
            Some(descriptor) => {
                tracing::debug!(task = %id, handler = descriptor.id(), "Handling failure");
                descriptor.instantiate().handle(id, error)
            }
            None => self.default.handle(id, error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use anyhow::anyhow;

    fn substitute(value: &'static str) -> HandlerDescriptor {
        HandlerDescriptor::new(format!("handler::{value}"), "app::Flaky", move || {
            move |_: &TaskId, _: anyhow::Error| -> TaskResult<Option<Value>> {
                Ok(Some(Value::encode(value)?))
            }
        })
    }

    #[test]
    fn test_default_rethrows() {
        let resolver = Resolver::new(HashMap::new(), Arc::new(Rethrow));
        let err = resolver
            .resolve(&TaskId::from("app::Flaky"), anyhow!("boom"))
            .unwrap_err();

        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_registered_handler_substitutes() {
        let handler = substitute("fallback");
        let resolver = Resolver::new(
            HashMap::from([(handler.task_id().clone(), handler)]),
            Arc::new(Rethrow),
        );

        let value = resolver
            .resolve(&TaskId::from("app::Flaky"), anyhow!("boom"))
            .unwrap()
            .unwrap();
        assert_eq!(value.decode::<String>().unwrap(), "fallback");

        let other = resolver.resolve(&TaskId::from("app::Other"), anyhow!("boom"));
        assert!(other.is_err());
    }
}
