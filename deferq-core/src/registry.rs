//! Executor registry: maps job type tags to executor constructors.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::DispatchError;
use crate::executor::Executor;
use crate::types::{Job, JobData};

/// Builds a populated executor from a job payload.
pub trait ExecutorFactory: Send + Sync {
    fn create(&self, job_type: &str, data: &JobData) -> Result<Box<dyn Executor>, DispatchError>;
}

/// Factory that starts every dispatch from the value returned by `new`.
struct Prototype<E, F> {
    new: F,
    _executor: PhantomData<fn() -> E>,
}

impl<E, F> ExecutorFactory for Prototype<E, F>
where
    E: Executor + Serialize + DeserializeOwned,
    F: Fn() -> E + Send + Sync,
{
    fn create(&self, job_type: &str, data: &JobData) -> Result<Box<dyn Executor>, DispatchError> {
        let executor: E = populate(job_type, (self.new)(), data)?;
        Ok(Box::new(executor))
    }
}

/// Overlay `data` onto a fresh instance.
///
/// Fields missing from the payload keep the value `fresh` had; keys the
/// executor does not know are ignored unless it denies unknown fields.
pub fn populate<E>(job_type: &str, fresh: E, data: &JobData) -> Result<E, DispatchError>
where
    E: Serialize + DeserializeOwned,
{
    let mut base = serde_json::to_value(fresh).map_err(|source| DispatchError::Encode {
        job_type: job_type.to_owned(),
        source,
    })?;

    match &mut base {
        Value::Object(fields) => {
            for (key, value) in data {
                fields.insert(key.clone(), value.clone());
            }
        }
        // Unit-like executors serialize to null; let the payload stand alone.
        _ if !data.is_empty() => base = Value::Object(data.clone()),
        _ => {}
    }

    serde_json::from_value(base).map_err(|source| DispatchError::Decode {
        job_type: job_type.to_owned(),
        source,
    })
}

/// Process-wide table of executors, filled before any monitoring starts and
/// read-only afterwards.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    factories: HashMap<String, Arc<dyn ExecutorFactory>>,
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.job_types().collect();
        types.sort_unstable();
        f.debug_struct("ExecutorRegistry")
            .field("job_types", &types)
            .finish()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `E` under `job_type`, using `E::default()` as the fresh
    /// instance. Overwrites any previous registration for the same type.
    pub fn register<E>(&mut self, job_type: impl Into<String>)
    where
        E: Executor + Default + Serialize + DeserializeOwned,
    {
        self.register_with(job_type, E::default);
    }

    /// Register an executor with an explicit constructor.
    pub fn register_with<E, F>(&mut self, job_type: impl Into<String>, new: F)
    where
        E: Executor + Serialize + DeserializeOwned,
        F: Fn() -> E + Send + Sync + 'static,
    {
        self.register_factory(
            job_type,
            Arc::new(Prototype {
                new,
                _executor: PhantomData,
            }),
        );
    }

    pub fn register_factory(&mut self, job_type: impl Into<String>, factory: Arc<dyn ExecutorFactory>) {
        let job_type = job_type.into();
        if self.factories.insert(job_type.clone(), factory).is_some() {
            tracing::debug!(%job_type, "executor registration replaced");
        }
    }

    #[inline]
    pub fn contains(&self, job_type: &str) -> bool {
        self.factories.contains_key(job_type)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Look up the executor for `job.job_type` and populate a fresh instance
    /// from its payload.
    pub fn resolve(&self, job: &Job) -> Result<Box<dyn Executor>, DispatchError> {
        let factory = self
            .factories
            .get(&job.job_type)
            .ok_or_else(|| DispatchError::UnknownType(job.job_type.clone()))?;
        factory.create(&job.job_type, &job.job_data)
    }
}
