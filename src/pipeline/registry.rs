//! Name-to-handler task registry with typed argument records.
//!
//! Task arguments arrive as JSON values and are bound to a handler's
//! argument struct before it runs:
//!
//! - an object binds by field name,
//! - an array binds positionally (trailing fields marked `#[serde(default)]`
//!   may be omitted),
//! - any other value is treated as a single positional argument,
//! - `null` binds like an empty object.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

type Handler<P> = Box<dyn Fn(&mut P, Value) -> Result<()> + Send + Sync>;

/// Argument record for tasks that take no arguments.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoArgs {}

/// Ordered collection of the tasks a pipeline type exposes.
pub struct TaskRegistry<P> {
    tasks: Vec<(&'static str, Handler<P>)>,
}

impl<P> Default for TaskRegistry<P> {
    fn default() -> Self {
        Self { tasks: Vec::new() }
    }
}

impl<P> TaskRegistry<P> {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task whose arguments deserialize into `A`.
    ///
    /// Registering an existing name replaces its handler.
    pub fn register<A, F>(mut self, name: &'static str, handler: F) -> Self
    where
        A: DeserializeOwned,
        F: Fn(&mut P, A) -> Result<()> + Send + Sync + 'static,
    {
        let boxed: Handler<P> = Box::new(move |pipeline, raw| {
            let args = bind_args::<A>(name, raw)?;
            handler(pipeline, args)
        });
        match self.tasks.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = boxed,
            None => self.tasks.push((name, boxed)),
        }
        self
    }

    /// Whether a task with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.tasks.iter().any(|(n, _)| *n == name)
    }

    /// Task names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tasks.iter().map(|(n, _)| *n)
    }

    /// Fail with a configuration error naming the first unknown task.
    pub fn check_names<S: AsRef<str>>(&self, names: &[S], owner: &str) -> Result<()> {
        for name in names {
            if !self.contains(name.as_ref()) {
                return Err(Error::Config(format!(
                    "Error defining the pipeline: {} method not found in class {}",
                    name.as_ref(),
                    owner
                )));
            }
        }
        Ok(())
    }

    /// Bind `args` and invoke the named task on `pipeline`.
    pub fn call(&self, pipeline: &mut P, name: &str, args: Value) -> Result<()> {
        let handler = self
            .tasks
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, h)| h)
            .ok_or_else(|| Error::Config(format!("unknown task: {}", name)))?;
        handler(pipeline, args)
    }
}

/// Bind a raw JSON argument value to a task's argument record.
pub fn bind_args<A: DeserializeOwned>(task: &str, raw: Value) -> Result<A> {
    let shaped = match raw {
        Value::Null => Value::Object(Default::default()),
        Value::Object(_) | Value::Array(_) => raw,
        scalar => Value::Array(vec![scalar]),
    };
    serde_json::from_value(shaped)
        .map_err(|e| Error::Config(format!("invalid arguments for task '{}': {}", task, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(deny_unknown_fields)]
    struct ScaleArgs {
        factor: f64,
        #[serde(default)]
        offset: Option<f64>,
    }

    #[derive(Default)]
    struct Counter {
        value: f64,
        calls: Vec<&'static str>,
    }

    fn registry() -> TaskRegistry<Counter> {
        TaskRegistry::new()
            .register("scale", |c: &mut Counter, a: ScaleArgs| {
                c.value = c.value * a.factor + a.offset.unwrap_or(0.0);
                c.calls.push("scale");
                Ok(())
            })
            .register("reset", |c: &mut Counter, _: NoArgs| {
                c.value = 1.0;
                c.calls.push("reset");
                Ok(())
            })
    }

    #[test]
    fn test_bind_keyword_arguments() {
        let args: ScaleArgs = bind_args("scale", json!({"factor": 2.0, "offset": 1.0})).unwrap();
        assert_eq!(args, ScaleArgs { factor: 2.0, offset: Some(1.0) });
    }

    #[test]
    fn test_bind_positional_arguments() {
        let args: ScaleArgs = bind_args("scale", json!([3.0, 0.5])).unwrap();
        assert_eq!(args, ScaleArgs { factor: 3.0, offset: Some(0.5) });
        let args: ScaleArgs = bind_args("scale", json!([3.0])).unwrap();
        assert_eq!(args, ScaleArgs { factor: 3.0, offset: None });
    }

    #[test]
    fn test_bind_scalar_as_single_positional() {
        let args: ScaleArgs = bind_args("scale", json!(4.0)).unwrap();
        assert_eq!(args.factor, 4.0);
    }

    #[test]
    fn test_bind_rejects_unknown_and_missing() {
        let err = bind_args::<ScaleArgs>("scale", json!({"factr": 2.0})).unwrap_err();
        assert!(err.to_string().contains("scale"));
        assert!(bind_args::<ScaleArgs>("scale", json!({})).is_err());
        assert!(bind_args::<ScaleArgs>("scale", json!([1.0, 2.0, 3.0])).is_err());
    }

    #[test]
    fn test_no_args_accepts_empty_shapes() {
        assert!(bind_args::<NoArgs>("reset", json!({})).is_ok());
        assert!(bind_args::<NoArgs>("reset", json!([])).is_ok());
        assert!(bind_args::<NoArgs>("reset", Value::Null).is_ok());
        assert!(bind_args::<NoArgs>("reset", json!({"x": 1})).is_err());
    }

    #[test]
    fn test_registry_call() {
        let reg = registry();
        let mut counter = Counter { value: 2.0, ..Default::default() };
        reg.call(&mut counter, "scale", json!([5.0])).unwrap();
        reg.call(&mut counter, "reset", json!({})).unwrap();
        reg.call(&mut counter, "scale", json!({"factor": 3.0, "offset": 1.0})).unwrap();
        assert_eq!(counter.value, 4.0);
        assert_eq!(counter.calls, vec!["scale", "reset", "scale"]);
        assert!(reg.call(&mut counter, "missing", json!({})).is_err());
    }

    #[test]
    fn test_check_names() {
        let reg = registry();
        assert!(reg.check_names(&["scale", "reset"], "Counter").is_ok());
        let err = reg.check_names(&["scale", "rotate"], "Counter").unwrap_err();
        assert!(err.to_string().contains("rotate"));
        assert_eq!(reg.names().collect::<Vec<_>>(), vec!["scale", "reset"]);
    }
}
