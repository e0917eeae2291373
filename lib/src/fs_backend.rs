// Copyright 2021 The Depot Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

//! Backend `01`: dense arrays in local container files.
//!
//! Element bytes are appended to a per-writer container file; the locator
//! records the container id, byte offset and length, plus a dtype/shape hint
//! so a read needs no side lookup. Containers are capped; a full container
//! triggers allocation of a fresh one.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read as _;
use std::io::Seek as _;
use std::io::SeekFrom;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use rand::Rng as _;

use crate::backend::BackendAccessor;
use crate::backend::BackendCode;
use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::Locator;
use crate::backend::OpenMode;
use crate::schema::Schema;
use crate::tensor::DType;
use crate::tensor::Payload;
use crate::tensor::PayloadKind;
use crate::tensor::Tensor;

/// Default cap on one container file.
const DEFAULT_CONTAINER_CAPACITY: u64 = 32 << 20;

fn generate_container_uid() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 4] = rng.random();
    crate::hex_util::encode_hex(&bytes)
}

struct ContainerWriter {
    uid: String,
    file: File,
    nbytes: u64,
}

pub struct FsArrayBackend {
    root: PathBuf,
    mode: OpenMode,
    capacity: u64,
    writer: Mutex<Option<ContainerWriter>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for FsArrayBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsArrayBackend")
            .field("root", &self.root)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl FsArrayBackend {
    /// Opens the backend rooted at `<data_dir>/01`, creating the directory
    /// when opened for writing.
    pub fn open(data_dir: &Path, mode: OpenMode) -> BackendResult<Self> {
        let root = data_dir.join(BackendCode::FS_ARRAY.as_str());
        if mode == OpenMode::Write {
            fs::create_dir_all(&root)?;
        }
        Ok(Self {
            root,
            mode,
            capacity: DEFAULT_CONTAINER_CAPACITY,
            writer: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    #[cfg(test)]
    fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    fn container_path(&self, uid: &str) -> PathBuf {
        self.root.join(format!("{uid}.dat"))
    }

    fn fresh_container(&self) -> BackendResult<ContainerWriter> {
        let uid = generate_container_uid();
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(self.container_path(&uid))?;
        Ok(ContainerWriter {
            uid,
            file,
            nbytes: 0,
        })
    }

    fn append(writer: &mut ContainerWriter, bytes: &[u8], capacity: u64) -> BackendResult<u64> {
        if writer.nbytes + bytes.len() as u64 > capacity {
            return Err(BackendError::Full {
                container: writer.uid.clone(),
            });
        }
        let offset = writer.nbytes;
        writer.file.write_all(bytes)?;
        writer.file.flush()?;
        writer.nbytes += bytes.len() as u64;
        Ok(offset)
    }

    fn check_open(&self) -> BackendResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::NotWritable);
        }
        Ok(())
    }
}

fn encode_suffix(uid: &str, offset: u64, nbytes: u64, tensor: &Tensor) -> String {
    let shape = tensor
        .shape()
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "{uid}:{offset}:{nbytes}:{dtype}:{shape}",
        dtype = tensor.dtype().code()
    )
}

struct ParsedSuffix {
    uid: String,
    offset: u64,
    nbytes: u64,
    dtype: DType,
    shape: Vec<u64>,
}

fn parse_suffix(locator: &Locator) -> BackendResult<ParsedSuffix> {
    let invalid = || BackendError::InvalidLocator(locator.encode());
    let parts: Vec<&str> = locator.suffix().split(':').collect();
    let [uid, offset, nbytes, dtype, shape] = parts.as_slice() else {
        return Err(invalid());
    };
    let shape = if shape.is_empty() {
        vec![]
    } else {
        shape
            .split(',')
            .map(str::parse)
            .collect::<Result<Vec<u64>, _>>()
            .map_err(|_| invalid())?
    };
    Ok(ParsedSuffix {
        uid: (*uid).to_string(),
        offset: offset.parse().map_err(|_| invalid())?,
        nbytes: nbytes.parse().map_err(|_| invalid())?,
        dtype: DType::from_code(dtype.parse().map_err(|_| invalid())?)
            .map_err(|_| invalid())?,
        shape,
    })
}

impl BackendAccessor for FsArrayBackend {
    fn code(&self) -> BackendCode {
        BackendCode::FS_ARRAY
    }

    fn kind(&self) -> PayloadKind {
        PayloadKind::Array
    }

    fn write(&self, payload: &Payload, _schema: &Schema) -> BackendResult<Locator> {
        self.check_open()?;
        if self.mode != OpenMode::Write {
            return Err(BackendError::NotWritable);
        }
        let Payload::Array(tensor) = payload else {
            return Err(BackendError::WrongKind {
                code: self.code().as_str().to_string(),
                kind: payload.kind(),
            });
        };

        let mut guard = self.writer.lock().unwrap();
        if guard.is_none() {
            *guard = Some(self.fresh_container()?);
        }
        let writer = guard.as_mut().unwrap();
        let offset = match Self::append(writer, tensor.data(), self.capacity) {
            Ok(offset) => offset,
            Err(BackendError::Full { container }) => {
                tracing::debug!(container, "array container full, rotating");
                *writer = self.fresh_container()?;
                Self::append(writer, tensor.data(), self.capacity)?
            }
            Err(err) => return Err(err),
        };
        let suffix = encode_suffix(&writer.uid, offset, tensor.nbytes() as u64, tensor);
        Ok(Locator::new(self.code(), suffix))
    }

    fn read(&self, locator: &Locator) -> BackendResult<Payload> {
        self.check_open()?;
        let parsed = parse_suffix(locator)?;
        let path = self.container_path(&parsed.uid);
        let mut file = File::open(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                BackendError::NotFound {
                    locator: locator.encode(),
                }
            } else {
                err.into()
            }
        })?;
        file.seek(SeekFrom::Start(parsed.offset))?;
        let mut data = vec![0; parsed.nbytes as usize];
        file.read_exact(&mut data).map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                BackendError::NotFound {
                    locator: locator.encode(),
                }
            } else {
                err.into()
            }
        })?;
        let tensor = Tensor::from_le_bytes(parsed.dtype, parsed.shape, data)
            .map_err(|_| BackendError::InvalidLocator(locator.encode()))?;
        Ok(Payload::Array(tensor))
    }

    fn delete(&self, locator: &Locator) -> BackendResult<()> {
        // Containers are append-only; the record simply becomes unreachable.
        self.check_open()?;
        parse_suffix(locator)?;
        Ok(())
    }

    fn close(&self) -> BackendResult<()> {
        *self.writer.lock().unwrap() = None;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
