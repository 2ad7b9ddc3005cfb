//! Recording in-memory providers.

use super::{
    ConvergeRequest, ConvergenceTarget, IdentityError, IdentityService, LifecyclePolicy,
    LifecycleRule, ObjectStorage, StackHandle,
};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Identity service over a fixed role table.
#[derive(Debug, Default)]
pub struct MemoryIdentityService {
    roles: IndexMap<String, String>,
    transport_failure: Option<String>,
    lookups: Mutex<Vec<String>>,
}

impl MemoryIdentityService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, name: &str, arn: &str) -> Self {
        self.roles.insert(name.to_string(), arn.to_string());
        self
    }

    /// Fail every lookup with a transport error.
    pub fn failing(mut self, message: &str) -> Self {
        self.transport_failure = Some(message.to_string());
        self
    }

    /// Every name looked up, in call order.
    pub fn lookups(&self) -> Vec<String> {
        guard(&self.lookups).clone()
    }
}

#[async_trait]
impl IdentityService for MemoryIdentityService {
    async fn lookup_role(&self, name: &str) -> Result<String, IdentityError> {
        guard(&self.lookups).push(name.to_string());
        if let Some(message) = &self.transport_failure {
            return Err(IdentityError::Transport(message.clone()));
        }
        self.roles.get(name).cloned().ok_or(IdentityError::NotFound)
    }
}

/// Object storage keeping bodies in memory.
#[derive(Debug, Default)]
pub struct MemoryObjectStorage {
    objects: Mutex<IndexMap<(String, String), Vec<u8>>>,
    deleted: Mutex<Vec<(String, String)>>,
    puts: Mutex<u32>,
    lifecycle: Option<Vec<LifecycleRule>>,
    fail_keys_containing: Option<String>,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lifecycle(mut self, rules: Vec<LifecycleRule>) -> Self {
        self.lifecycle = Some(rules);
        self
    }

    /// Reject every put whose key contains `fragment`.
    pub fn failing_puts_containing(mut self, fragment: &str) -> Self {
        self.fail_keys_containing = Some(fragment.to_string());
        self
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        guard(&self.objects)
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Keys currently stored, in insertion order.
    pub fn keys(&self) -> Vec<String> {
        guard(&self.objects).keys().map(|(_, k)| k.clone()).collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        guard(&self.deleted).iter().map(|(_, k)| k.clone()).collect()
    }

    pub fn put_count(&self) -> u32 {
        *guard(&self.puts)
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), String> {
        *guard(&self.puts) += 1;
        if let Some(fragment) = &self.fail_keys_containing {
            if key.contains(fragment.as_str()) {
                return Err(format!("put s3://{}/{} rejected", bucket, key));
            }
        }
        guard(&self.objects).insert((bucket.to_string(), key.to_string()), body);
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), String> {
        let id = (bucket.to_string(), key.to_string());
        guard(&self.objects).shift_remove(&id);
        guard(&self.deleted).push(id);
        Ok(())
    }

    async fn lifecycle_policy(&self, _bucket: &str) -> Result<LifecyclePolicy, String> {
        Ok(match &self.lifecycle {
            Some(rules) => LifecyclePolicy::Enabled(rules.clone()),
            None => LifecyclePolicy::NotConfigured,
        })
    }
}

/// Convergence target recording each request.
#[derive(Debug, Default)]
pub struct MemoryConvergenceTarget {
    requests: Mutex<Vec<ConvergeRequest>>,
    failure: Option<String>,
}

impl MemoryConvergenceTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every request.
    pub fn rejecting(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub fn requests(&self) -> Vec<ConvergeRequest> {
        guard(&self.requests).clone()
    }
}

#[async_trait]
impl ConvergenceTarget for MemoryConvergenceTarget {
    async fn converge(&self, request: ConvergeRequest) -> Result<StackHandle, String> {
        let stack_name = request.stack_name.clone();
        guard(&self.requests).push(request);
        if let Some(message) = &self.failure {
            return Err(message.clone());
        }
        Ok(StackHandle {
            stack_id: format!("memory:{}", stack_name),
            stack_name,
        })
    }
}
