use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use rand::Rng;
use tracing::{debug, error};

use super::credential::{Credential, CredentialSpec};
use crate::error::{ChatmuxError, Result};
use crate::upstream::UpstreamConnector;

/// All configured credentials, drawn at random without replacement until
/// each one has been handed out once, then the cycle starts over.
#[derive(Debug)]
pub struct CredentialPool {
    credentials: Vec<Arc<Credential>>,
    used: Mutex<HashSet<usize>>,
}

impl CredentialPool {
    pub fn new(credentials: Vec<Arc<Credential>>) -> Result<Self> {
        if credentials.is_empty() {
            return Err(ChatmuxError::Config(
                "no upstream credentials configured (engine.tokens is empty)".to_string(),
            ));
        }

        Ok(Self {
            credentials,
            used: Mutex::new(HashSet::new()),
        })
    }

    /// Parse every spec and log each credential in
    pub async fn connect(
        specs: &[String],
        connector: Arc<dyn UpstreamConnector>,
    ) -> Result<Self> {
        let mut credentials = Vec::with_capacity(specs.len());
        for raw in specs {
            let spec = CredentialSpec::parse(raw)?;
            let credential = Credential::connect(spec, Arc::clone(&connector))
                .await
                .inspect_err(|e| error!("Init Credential Error: {}", e))?;
            credentials.push(Arc::new(credential));
        }
        Self::new(credentials)
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn credentials(&self) -> &[Arc<Credential>] {
        &self.credentials
    }

    pub fn set_verbose(&self, verbose: bool) {
        for credential in &self.credentials {
            credential.set_verbose(verbose);
        }
    }

    pub fn pick_random(&self) -> Arc<Credential> {
        self.pick_with(&mut rand::thread_rng())
    }

    fn pick_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Arc<Credential> {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        if used.len() >= self.credentials.len() {
            used.clear();
        }

        let available: Vec<usize> = (0..self.credentials.len())
            .filter(|index| !used.contains(index))
            .collect();
        let index = available[rng.gen_range(0..available.len())];
        used.insert(index);

        debug!(
            "Picked credential {} ({}/{} used this cycle)",
            self.credentials[index].email(),
            used.len(),
            self.credentials.len()
        );
        Arc::clone(&self.credentials[index])
    }
}
