//! The stage that does asynchronous file io.
//!
//! Callers never block on the filesystem: they queue an operation
//! tagged with the connection that asked for it, and the helper's
//! workers emit a completion event back through the supplied sink.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::connection::ConnId;
use crate::event::StageEvent;
use crate::stage::{Stage, StageHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
    Append,
}

pub enum FileIoEvent {
    Open { source: ConnId, path: PathBuf, mode: FileMode },
    Read { source: ConnId, file: Arc<Mutex<File>>, bytes: usize },
    Write { source: ConnId, file: Arc<Mutex<File>>, data: Vec<u8> },
    Seek { source: ConnId, file: Arc<Mutex<File>>, offset: u64 },
}

impl StageEvent for FileIoEvent {}

/// Completion events posted back to the invoking stage.
pub enum FileIoResult {
    Opened { source: ConnId, file: io::Result<Arc<Mutex<File>>> },
    ReadDone { source: ConnId, data: io::Result<Vec<u8>> },
    WriteDone { source: ConnId, written: io::Result<usize> },
    SeekDone { source: ConnId, position: io::Result<u64> },
}

pub type FileIoStage = Stage<FileIoCore>;

pub struct FileIoCore {
    sink: Box<dyn Fn(FileIoResult) + Send + Sync>,
}

impl FileIoCore {
    pub fn new<F>(sink: F) -> FileIoCore
        where F: Fn(FileIoResult) + Send + Sync + 'static
    {
        FileIoCore { sink: Box::new(sink) }
    }
}

impl StageHandler for FileIoCore {
    type Event = FileIoEvent;

    fn handle(&self, event: FileIoEvent) {
        let result = match event {
            FileIoEvent::Open { source, path, mode } => {
                let mut options = OpenOptions::new();
                match mode {
                    FileMode::Read => options.read(true),
                    FileMode::Write =>
                        options.write(true).create(true).truncate(true),
                    FileMode::Append =>
                        options.append(true).create(true),
                };
                FileIoResult::Opened {
                    source: source,
                    file: options.open(&path)
                        .map(|f| Arc::new(Mutex::new(f))),
                }
            }
            FileIoEvent::Read { source, file, bytes } => {
                let mut data = vec![0u8; bytes];
                let outcome = file.lock()
                    .expect("helper file poisoned")
                    .read(&mut data)
                    .map(|n| {
                        data.truncate(n);
                        data
                    });
                FileIoResult::ReadDone { source: source, data: outcome }
            }
            FileIoEvent::Write { source, file, data } => {
                let outcome = file.lock()
                    .expect("helper file poisoned")
                    .write(&data);
                FileIoResult::WriteDone {
                    source: source,
                    written: outcome,
                }
            }
            FileIoEvent::Seek { source, file, offset } => {
                let outcome = file.lock()
                    .expect("helper file poisoned")
                    .seek(SeekFrom::Start(offset));
                FileIoResult::SeekDone {
                    source: source,
                    position: outcome,
                }
            }
        };
        (self.sink)(result);
    }
}

/// Convenience constructors mirroring the helper's public surface.
impl FileIoCore {
    pub fn open_file(stage: &FileIoStage, source: ConnId,
                     path: PathBuf, mode: FileMode)
        -> bool
    {
        stage.queue_event(FileIoEvent::Open {
            source: source, path: path, mode: mode,
        })
    }

    pub fn read_bytes(stage: &FileIoStage, source: ConnId,
                      file: Arc<Mutex<File>>, bytes: usize)
        -> bool
    {
        stage.queue_event(FileIoEvent::Read {
            source: source, file: file, bytes: bytes,
        })
    }

    pub fn write_bytes(stage: &FileIoStage, source: ConnId,
                       file: Arc<Mutex<File>>, data: Vec<u8>)
        -> bool
    {
        stage.queue_event(FileIoEvent::Write {
            source: source, file: file, data: data,
        })
    }

    pub fn seek_offset(stage: &FileIoStage, source: ConnId,
                       file: Arc<Mutex<File>>, offset: u64)
        -> bool
    {
        stage.queue_event(FileIoEvent::Seek {
            source: source, file: file, offset: offset,
        })
    }
}

#[cfg(test)]
mod test {
    use std::sync::mpsc::channel;
    use std::sync::Mutex;

    use crate::connection::ConnId;
    use crate::stage::Stage;
    use super::{FileIoCore, FileIoResult, FileMode};

    #[test]
    fn write_then_read_round_trip() {
        let path = std::env::temp_dir()
            .join(format!("seda-http-fileio-{}", std::process::id()));
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        let stage = Stage::new("file-io", FileIoCore::new(move |r| {
            tx.lock().unwrap().send(r).unwrap();
        }), 0);

        FileIoCore::open_file(&stage, ConnId(1), path.clone(),
                              FileMode::Write);
        let file = match rx.try_recv().unwrap() {
            FileIoResult::Opened { source, file } => {
                assert_eq!(source, ConnId(1));
                file.unwrap()
            }
            _ => panic!("expected open completion"),
        };
        FileIoCore::write_bytes(&stage, ConnId(1), file, b"data".to_vec());
        match rx.try_recv().unwrap() {
            FileIoResult::WriteDone { written, .. } => {
                assert_eq!(written.unwrap(), 4);
            }
            _ => panic!("expected write completion"),
        }

        FileIoCore::open_file(&stage, ConnId(2), path.clone(),
                              FileMode::Read);
        let file = match rx.try_recv().unwrap() {
            FileIoResult::Opened { file, .. } => file.unwrap(),
            _ => panic!("expected open completion"),
        };
        FileIoCore::read_bytes(&stage, ConnId(2), file, 64);
        match rx.try_recv().unwrap() {
            FileIoResult::ReadDone { data, .. } => {
                assert_eq!(data.unwrap(), b"data".to_vec());
            }
            _ => panic!("expected read completion"),
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn open_missing_file_reports_error() {
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        let stage = Stage::new("file-io", FileIoCore::new(move |r| {
            tx.lock().unwrap().send(r).unwrap();
        }), 0);
        FileIoCore::open_file(&stage, ConnId(3),
                              "/nonexistent/path".into(),
                              FileMode::Read);
        match rx.try_recv().unwrap() {
            FileIoResult::Opened { file, .. } => {
                assert!(file.is_err());
            }
            _ => panic!("expected open completion"),
        }
    }
}
