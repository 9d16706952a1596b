//! Scripted [`ControlPlane`] that records every call it receives.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::{ControlPlane, EXTENSION_TYPE, ExtensionDescriptor, ExtensionStatusRecord, PutResponse, Scope};
use crate::error::RotatorError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    List,
    Delete(String),
    Put(String),
    Get(String),
}

impl Call {
    pub(crate) fn vm(&self) -> Option<&str> {
        match self {
            Self::List => None,
            Self::Delete(vm) | Self::Put(vm) | Self::Get(vm) => Some(vm),
        }
    }
}

type Script<T> = Mutex<HashMap<String, VecDeque<Result<T, RotatorError>>>>;

/// Replies are consumed per VM in order; the last scripted reply repeats.
/// Unscripted deletes answer 200, puts 202 and status reads `InProgress`.
pub(crate) struct MockControlPlane {
    listing: Result<Vec<String>, RotatorError>,
    deletes: Script<u16>,
    puts: Script<PutResponse>,
    statuses: Script<ExtensionStatusRecord>,
    calls: Mutex<Vec<Call>>,
}

impl MockControlPlane {
    pub(crate) fn with_vms(vms: &[&str]) -> Self {
        Self {
            listing: Ok(vms.iter().map(|v| (*v).to_string()).collect()),
            deletes: Mutex::default(),
            puts: Mutex::default(),
            statuses: Mutex::default(),
            calls: Mutex::default(),
        }
    }

    pub(crate) fn with_listing_error(err: RotatorError) -> Self {
        let mut mock = Self::with_vms(&[]);
        mock.listing = Err(err);
        mock
    }

    pub(crate) fn on_delete(self, vm: &str, reply: Result<u16, RotatorError>) -> Self {
        push(&self.deletes, vm, reply);
        self
    }

    pub(crate) fn on_put(self, vm: &str, reply: Result<PutResponse, RotatorError>) -> Self {
        push(&self.puts, vm, reply);
        self
    }

    pub(crate) fn on_status(self, vm: &str, reply: Result<ExtensionStatusRecord, RotatorError>) -> Self {
        push(&self.statuses, vm, reply);
        self
    }

    /// Script the provisioning states of the VMAccess extension for `vm`.
    pub(crate) fn with_states(self, vm: &str, states: &[&str]) -> Self {
        states.iter().fold(self, |mock, state| {
            let record = [(EXTENSION_TYPE, *state)].into_iter().collect();
            mock.on_status(vm, Ok(record))
        })
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn calls_for(&self, vm: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.vm() == Some(vm))
            .collect()
    }

    pub(crate) fn status_reads(&self, vm: &str) -> usize {
        self.calls_for(vm)
            .iter()
            .filter(|c| matches!(c, Call::Get(_)))
            .count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

fn push<T>(script: &Script<T>, vm: &str, reply: Result<T, RotatorError>) {
    script
        .lock()
        .unwrap()
        .entry(vm.to_string())
        .or_default()
        .push_back(reply);
}

fn next<T: Clone>(script: &Script<T>, vm: &str) -> Option<Result<T, RotatorError>> {
    let mut script = script.lock().unwrap();
    let queue = script.get_mut(vm)?;
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn list_vms(&self, _scope: &Scope) -> Result<Vec<String>, RotatorError> {
        self.record(Call::List);
        self.listing.clone()
    }

    async fn delete_extension(&self, _scope: &Scope, vm_name: &str) -> Result<u16, RotatorError> {
        self.record(Call::Delete(vm_name.to_string()));
        next(&self.deletes, vm_name).unwrap_or(Ok(200))
    }

    async fn put_extension(
        &self,
        _scope: &Scope,
        vm_name: &str,
        _descriptor: &ExtensionDescriptor,
    ) -> Result<PutResponse, RotatorError> {
        self.record(Call::Put(vm_name.to_string()));
        next(&self.puts, vm_name).unwrap_or_else(|| {
            Ok(PutResponse {
                status: 202,
                body: String::new(),
            })
        })
    }

    async fn get_extension_status(
        &self,
        _scope: &Scope,
        vm_name: &str,
    ) -> Result<ExtensionStatusRecord, RotatorError> {
        self.record(Call::Get(vm_name.to_string()));
        next(&self.statuses, vm_name)
            .unwrap_or_else(|| Ok([(EXTENSION_TYPE, "InProgress")].into_iter().collect()))
    }
}
