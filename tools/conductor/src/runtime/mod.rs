pub mod connection;

use crate::errors::ConductorError;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

pub use connection::{
    ConnectionProvider, FakeConnectionProvider, MessageCallback, PeerHandle, ScriptedMessage,
};

pub trait Clock: Send + Sync {
    /// Wall-clock time in unix milliseconds.
    fn now_ms(&self) -> i64;
}

pub trait Terminal: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), ConductorError>;
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn write_line(&self, line: &str) -> Result<(), ConductorError> {
        use std::io::Write;
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| ConductorError::Io(e.to_string()))
    }
}

/// Collaborators handed to the CLI. `provider` overrides the TCP transport
/// built from configuration.
pub struct Runtime {
    pub clock: Arc<dyn Clock>,
    pub terminal: Arc<dyn Terminal>,
    pub provider: Option<Arc<dyn ConnectionProvider>>,
}

impl Runtime {
    pub fn production() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            terminal: Arc::new(ProductionTerminal),
            provider: None,
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::production()
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<i64>>,
}

impl FakeClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: Arc::new(Mutex::new(now_ms)),
        }
    }

    pub fn advance(&self, millis: i64) {
        if let Ok(mut now) = self.now.lock() {
            *now = now.saturating_add(millis);
        }
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(1_700_000_000_000)
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> i64 {
        self.now.lock().map(|now| *now).unwrap_or(0)
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    writes: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn written_lines(&self) -> Vec<String> {
        self.writes
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }
}

impl Terminal for FakeTerminal {
    fn write_line(&self, line: &str) -> Result<(), ConductorError> {
        self.writes
            .lock()
            .map_err(|_| ConductorError::Io("terminal lock poisoned".to_string()))?
            .push(line.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, FakeClock, FakeTerminal, Terminal};

    #[test]
    fn fake_clock_advances_deterministically() {
        let clock = FakeClock::new(1_000);
        clock.advance(250);
        assert_eq!(clock.now_ms(), 1_250);
    }

    #[test]
    fn fake_terminal_records_lines() {
        let terminal = FakeTerminal::default();
        terminal.write_line("status=passed").expect("write");
        assert_eq!(terminal.written_lines(), vec!["status=passed".to_string()]);
    }
}
