//! In-memory adapter for tests and dry runs.

use super::Adapter;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

/// Adapter answering commands from a closure and recording everything written.
///
/// The written log is shared, so a test can keep a copy after the adapter has been
/// moved into a procedure.
pub struct MockAdapter {
    responder: Responder,
    pending: VecDeque<String>,
    bytes: VecDeque<u8>,
    written: Arc<Mutex<Vec<String>>>,
}

impl std::fmt::Debug for MockAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockAdapter")
            .field("pending", &self.pending)
            .field("written", &self.written.lock().len())
            .finish_non_exhaustive()
    }
}

impl MockAdapter {
    /// Adapter that produces a response for each command `responder` accepts.
    pub fn new(responder: impl FnMut(&str) -> Option<String> + Send + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            pending: VecDeque::new(),
            bytes: VecDeque::new(),
            written: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Adapter replaying `responses` in order, one per command.
    pub fn scripted(responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut script: VecDeque<String> = responses.into_iter().map(Into::into).collect();
        Self::new(move |_| script.pop_front())
    }

    /// Simulated voltmeter: `MEAS:VOLT?` returns a slowly rising reading in mV.
    pub fn voltmeter() -> Self {
        let mut reading = 0u32;
        Self::new(move |command| match command {
            "*IDN?" => Some("MOCK,VOLTMETER,0,1.0".to_string()),
            "MEAS:VOLT?" => {
                reading += 1;
                Some(format!("{:.1} mV", 100.0 + 12.5 * f64::from(reading)))
            }
            _ => None,
        })
    }

    /// Queue raw bytes for [`Adapter::read_bytes`].
    pub fn with_bytes(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend(bytes);
        self
    }

    /// Shared log of written commands.
    pub fn written(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.written)
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        self.written.lock().push(command.to_string());
        if let Some(response) = (self.responder)(command) {
            self.pending.push_back(response);
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<String> {
        self.pending
            .pop_front()
            .ok_or_else(|| anyhow!("mock adapter: no response pending"))
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.written
            .lock()
            .push(String::from_utf8_lossy(bytes).into_owned());
        Ok(())
    }

    async fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        if self.bytes.len() < count {
            return Err(anyhow!(
                "mock adapter: {count} bytes requested, {} available",
                self.bytes.len()
            ));
        }
        Ok(self.bytes.drain(..count).collect())
    }
}
