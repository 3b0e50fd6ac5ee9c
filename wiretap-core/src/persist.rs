//! Mock persistence boundary: exactly two operations. The replay driver
//! loads the full set once per session; the recorder hands each captured
//! exchange to a sink.

use crate::error::ProxyError;
use crate::mock::Mock;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

pub trait MockSource: Send + Sync {
    /// The full set for a replay session.
    fn load_mocks(&self) -> Result<Vec<Mock>, ProxyError>;
}

pub trait MockSink: Send + Sync {
    /// The recorder hands each exchange to the sink as it completes.
    fn emit(&self, mock: Mock) -> Result<(), ProxyError>;
}

/// File-backed mocks, one YAML document holding the whole list.
pub struct YamlMockFile {
    path: PathBuf,
    /// Serialized writes; the recorder appends from many connection tasks.
    pending: Mutex<Vec<Mock>>,
}

impl YamlMockFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, mocks: &[Mock]) -> Result<(), ProxyError> {
        let contents = serde_yaml_ng::to_string(mocks)
            .map_err(|e| ProxyError::Io(std::io::Error::other(e)))?;
        std::fs::write(&self.path, contents).map_err(ProxyError::Io)?;
        Ok(())
    }
}

impl MockSource for YamlMockFile {
    fn load_mocks(&self) -> Result<Vec<Mock>, ProxyError> {
        let contents = std::fs::read_to_string(&self.path).map_err(ProxyError::Io)?;
        let mocks: Vec<Mock> = serde_yaml_ng::from_str(&contents)
            .map_err(|e| ProxyError::ProtocolViolation(format!("mock file: {}", e)))?;
        info!(path = %self.path.display(), count = mocks.len(), "Loaded mocks");
        Ok(mocks)
    }
}

impl MockSink for YamlMockFile {
    fn emit(&self, mock: Mock) -> Result<(), ProxyError> {
        let mut pending = self.pending.lock().unwrap();
        debug!(name = %mock.name, kind = ?mock.kind, "Recorded mock");
        pending.push(mock);
        self.flush(&pending)
    }
}

/// In-memory sink for tests and embedding.
#[derive(Default)]
pub struct MemorySink {
    mocks: Mutex<Vec<Mock>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Mock> {
        std::mem::take(&mut self.mocks.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.mocks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mocks.lock().unwrap().is_empty()
    }
}

impl MockSink for MemorySink {
    fn emit(&self, mock: Mock) -> Result<(), ProxyError> {
        self.mocks.lock().unwrap().push(mock);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{GenericSpec, MockKind, MockSpec};
    use time::OffsetDateTime;

    fn sample(name: &str) -> Mock {
        Mock::new(
            MockKind::Generic,
            name,
            MockSpec::Generic(GenericSpec {
                request: b"req".to_vec(),
                response: b"resp".to_vec(),
                request_at: OffsetDateTime::UNIX_EPOCH,
                response_at: OffsetDateTime::UNIX_EPOCH,
            }),
            0,
        )
    }

    #[test]
    fn yaml_file_round_trips() {
        let path = std::env::temp_dir().join(format!("wiretap-mocks-{}.yaml", std::process::id()));
        let file = YamlMockFile::new(&path);

        file.emit(sample("mock-0")).unwrap();
        file.emit(sample("mock-1")).unwrap();

        let loaded = file.load_mocks().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name, "mock-0");
        assert_eq!(loaded[1].name, "mock-1");
        assert!(loaded.iter().all(|m| m.test_mode_info.is_filtered));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn memory_sink_collects() {
        let sink = MemorySink::new();
        sink.emit(sample("a")).unwrap();
        sink.emit(sample("b")).unwrap();
        assert_eq!(sink.len(), 2);
        let taken = sink.take();
        assert_eq!(taken[1].name, "b");
        assert!(sink.is_empty());
    }
}
