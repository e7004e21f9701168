//! Typed, file-backed state shared between test stages.
//!
//! Each test directory owns one store rooted at `<dir>/.test-data`. Every
//! logical name maps to one JSON file holding an envelope that records the
//! shape of the value, so a missing value and a corrupt or mismatched one
//! produce different errors. Values survive process restarts; nothing here
//! ever expires or deletes state on its own.
//!
//! The store performs no locking. Concurrent writers to the same directory
//! must use distinct logical names; writes are atomic renames, so the last
//! writer wins and readers never observe a partial file.

use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs::OpenOptions;
use cap_std::fs_utf8::{Dir, File};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::key_pair::RegisteredKeyPair;
use crate::random::unique_id;
use crate::terraform::TerraformOptions;

/// Directory created inside each test directory to hold persisted values.
pub const TEST_DATA_DIR: &str = ".test-data";

/// Conventional logical name for provisioning options.
pub const OPTIONS_KEY: &str = "terraform-options";

/// Conventional logical name for the test's registered key pair.
pub const KEY_PAIR_KEY: &str = "key-pair";

/// Envelope format written by this version of the store.
pub const FORMAT_VERSION: u32 = 1;

const FILE_EXTENSION: &str = ".json";
const UNKNOWN_KIND: &str = "unknown";

/// Errors raised by [`StateStore`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StoreError {
    /// Raised when a logical name cannot be mapped to a file name.
    #[error("invalid logical name '{name}': use ASCII letters, digits, '-', '_' or '.'")]
    InvalidName {
        /// Rejected logical name.
        name: String,
    },
    /// Raised when no value has been saved under the logical name.
    #[error("no stored value for '{name}' at {path}; did the setup stage run?")]
    Missing {
        /// Logical name that was requested.
        name: String,
        /// File that was expected to hold the value.
        path: Utf8PathBuf,
    },
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when stored content does not match the requested shape.
    #[error("failed to decode {path}: {message}")]
    Decode {
        /// File holding the undecodable content.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a value cannot be serialised.
    #[error("failed to encode '{name}': {message}")]
    Encode {
        /// Logical name being written.
        name: String,
        /// Serialiser error message.
        message: String,
    },
}

impl StoreError {
    /// Returns `true` when the requested value was never saved.
    #[must_use]
    pub const fn is_missing(&self) -> bool {
        matches!(self, Self::Missing { .. })
    }

    /// Returns `true` when stored content exists but does not decode.
    #[must_use]
    pub const fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}

/// Shape of a persisted value as recorded in its envelope.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueKind {
    /// [`TerraformOptions`].
    TerraformOptions,
    /// [`RegisteredKeyPair`].
    KeyPair,
    /// Plain string.
    String,
}

impl ValueKind {
    /// Returns the envelope tag for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TerraformOptions => "terraform-options",
            Self::KeyPair => "key-pair",
            Self::String => "string",
        }
    }

    const fn is_secret(self) -> bool {
        matches!(self, Self::KeyPair)
    }
}

trait Persisted: Serialize + DeserializeOwned {
    const KIND: ValueKind;
}

impl Persisted for TerraformOptions {
    const KIND: ValueKind = ValueKind::TerraformOptions;
}

impl Persisted for RegisteredKeyPair {
    const KIND: ValueKind = ValueKind::KeyPair;
}

impl Persisted for String {
    const KIND: ValueKind = ValueKind::String;
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    kind: ValueKind,
    format_version: u32,
    value: &'a T,
}

#[derive(Deserialize)]
struct RawEnvelope {
    kind: String,
    format_version: u32,
    value: serde_json::Value,
}

/// A persisted value read without committing to its shape.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredValue {
    /// Envelope kind tag.
    pub kind: String,
    /// Raw payload.
    pub value: serde_json::Value,
}

/// Summary of one persisted value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredEntry {
    /// Logical name.
    pub name: String,
    /// Envelope kind tag, or `unknown` when the file does not decode.
    pub kind: String,
    /// File holding the value.
    pub path: Utf8PathBuf,
}

/// Keyed persistence scoped to one test directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StateStore {
    test_dir: Utf8PathBuf,
    data_dir: Utf8PathBuf,
}

impl StateStore {
    /// Opens the store for `test_dir`. Nothing is created until a value is
    /// saved.
    #[must_use]
    pub fn new(test_dir: impl Into<Utf8PathBuf>) -> Self {
        let test_dir = test_dir.into();
        let data_dir = test_dir.join(TEST_DATA_DIR);
        Self { test_dir, data_dir }
    }

    /// Returns the test directory this store is scoped to.
    #[must_use]
    pub fn test_dir(&self) -> &Utf8Path {
        &self.test_dir
    }

    /// Returns the directory holding persisted files.
    #[must_use]
    pub fn data_dir(&self) -> &Utf8Path {
        &self.data_dir
    }

    /// Returns the file used for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidName`] when `name` is not a valid
    /// logical name.
    pub fn path_for(&self, name: &str) -> Result<Utf8PathBuf, StoreError> {
        Ok(self.data_dir.join(file_name_for(name)?))
    }

    /// Saves provisioning options under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the name is invalid or the file cannot be
    /// written.
    pub fn save_options(
        &self,
        name: &str,
        options: &TerraformOptions,
    ) -> Result<Utf8PathBuf, StoreError> {
        self.save(name, options)
    }

    /// Loads provisioning options saved under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Missing`] when nothing was saved and
    /// [`StoreError::Decode`] when the file holds something else.
    pub fn load_options(&self, name: &str) -> Result<TerraformOptions, StoreError> {
        self.load(name)
    }

    /// Saves a registered key pair under `name`. On Unix the file is only
    /// readable by the current user.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the name is invalid or the file cannot be
    /// written.
    pub fn save_key_pair(
        &self,
        name: &str,
        key_pair: &RegisteredKeyPair,
    ) -> Result<Utf8PathBuf, StoreError> {
        self.save(name, key_pair)
    }

    /// Loads a registered key pair saved under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Missing`] when nothing was saved and
    /// [`StoreError::Decode`] when the file holds something else.
    pub fn load_key_pair(&self, name: &str) -> Result<RegisteredKeyPair, StoreError> {
        self.load(name)
    }

    /// Saves a string under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the name is invalid or the file cannot be
    /// written.
    pub fn save_string(&self, name: &str, value: &str) -> Result<Utf8PathBuf, StoreError> {
        self.save(name, &value.to_owned())
    }

    /// Loads a string saved under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Missing`] when nothing was saved and
    /// [`StoreError::Decode`] when the file holds something else.
    pub fn load_string(&self, name: &str) -> Result<String, StoreError> {
        self.load(name)
    }

    /// Reads the envelope saved under `name` without checking its shape.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Missing`] when nothing was saved and
    /// [`StoreError::Decode`] when the file is not a valid envelope.
    pub fn load_raw(&self, name: &str) -> Result<StoredValue, StoreError> {
        let path = self.path_for(name)?;
        let contents = self.read(name, &path)?;
        let envelope = parse_envelope(&path, &contents)?;
        Ok(StoredValue {
            kind: envelope.kind,
            value: envelope.value,
        })
    }

    /// Reports whether a value is stored under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the name is invalid or the directory
    /// cannot be inspected.
    pub fn exists(&self, name: &str) -> Result<bool, StoreError> {
        let file_name = file_name_for(name)?;
        let Some(dir) = self.open_data_dir()? else {
            return Ok(false);
        };
        dir.try_exists(&file_name).map_err(|err| StoreError::Io {
            path: self.data_dir.join(&file_name),
            message: err.to_string(),
        })
    }

    /// Removes the value stored under `name`, returning whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the name is invalid or the file cannot be
    /// removed.
    pub fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let file_name = file_name_for(name)?;
        let Some(dir) = self.open_data_dir()? else {
            return Ok(false);
        };
        match dir.remove_file(&file_name) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::Io {
                path: self.data_dir.join(&file_name),
                message: err.to_string(),
            }),
        }
    }

    /// Removes every persisted value, returning whether anything existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the directory cannot be removed.
    pub fn clear(&self) -> Result<bool, StoreError> {
        let test_dir = match Dir::open_ambient_dir(&self.test_dir, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => {
                return Err(StoreError::Io {
                    path: self.test_dir.clone(),
                    message: err.to_string(),
                });
            }
        };
        match test_dir.remove_dir_all(TEST_DATA_DIR) {
            Ok(()) => {
                debug!(path = %self.data_dir, "cleared persisted stage state");
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::Io {
                path: self.data_dir.clone(),
                message: err.to_string(),
            }),
        }
    }

    /// Lists persisted values sorted by logical name.
    ///
    /// Files that do not decode are listed with an `unknown` kind.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the directory cannot be read.
    pub fn entries(&self) -> Result<Vec<StoredEntry>, StoreError> {
        let Some(dir) = self.open_data_dir()? else {
            return Ok(Vec::new());
        };
        let io_error = |err: io::Error| StoreError::Io {
            path: self.data_dir.clone(),
            message: err.to_string(),
        };

        let mut entries = Vec::new();
        for entry in dir.entries().map_err(io_error)? {
            let file_name = entry.map_err(io_error)?.file_name().map_err(io_error)?;
            let Some(name) = file_name.strip_suffix(FILE_EXTENSION) else {
                continue;
            };
            if !is_valid_name(name) {
                continue;
            }
            let path = self.data_dir.join(&file_name);
            let kind = dir
                .read_to_string(&file_name)
                .ok()
                .and_then(|contents| parse_envelope(&path, &contents).ok())
                .map_or_else(|| String::from(UNKNOWN_KIND), |envelope| envelope.kind);
            entries.push(StoredEntry {
                name: name.to_owned(),
                kind,
                path,
            });
        }
        entries.sort_by(|left, right| left.name.cmp(&right.name));
        Ok(entries)
    }

    fn save<T: Persisted>(&self, name: &str, value: &T) -> Result<Utf8PathBuf, StoreError> {
        let file_name = file_name_for(name)?;
        let path = self.data_dir.join(&file_name);
        let rendered = serde_json::to_string_pretty(&EnvelopeRef {
            kind: T::KIND,
            format_version: FORMAT_VERSION,
            value,
        })
        .map_err(|err| StoreError::Encode {
            name: name.to_owned(),
            message: err.to_string(),
        })?;

        Dir::create_ambient_dir_all(&self.data_dir, ambient_authority()).map_err(|err| {
            StoreError::Io {
                path: self.data_dir.clone(),
                message: err.to_string(),
            }
        })?;
        let dir = Dir::open_ambient_dir(&self.data_dir, ambient_authority()).map_err(|err| {
            StoreError::Io {
                path: self.data_dir.clone(),
                message: err.to_string(),
            }
        })?;

        let staging_name = format!(".{file_name}.tmp-{}", unique_id());
        if let Err(err) = write_staged(&dir, &staging_name, &file_name, &rendered, T::KIND) {
            dir.remove_file(&staging_name).ok();
            return Err(StoreError::Io {
                path,
                message: err.to_string(),
            });
        }

        debug!(name, kind = T::KIND.as_str(), path = %path, "saved stage state");
        Ok(path)
    }

    fn load<T: Persisted>(&self, name: &str) -> Result<T, StoreError> {
        let path = self.path_for(name)?;
        let contents = self.read(name, &path)?;
        let envelope = parse_envelope(&path, &contents)?;

        if envelope.kind != T::KIND.as_str() {
            return Err(StoreError::Decode {
                path,
                message: format!(
                    "expected a {} value but found {}",
                    T::KIND.as_str(),
                    envelope.kind
                ),
            });
        }
        if envelope.format_version != FORMAT_VERSION {
            return Err(StoreError::Decode {
                path,
                message: format!(
                    "unsupported format version {} (expected {FORMAT_VERSION})",
                    envelope.format_version
                ),
            });
        }

        serde_json::from_value(envelope.value).map_err(|err| StoreError::Decode {
            path,
            message: err.to_string(),
        })
    }

    fn read(&self, name: &str, path: &Utf8Path) -> Result<String, StoreError> {
        let missing = || StoreError::Missing {
            name: name.to_owned(),
            path: path.to_path_buf(),
        };
        let Some(dir) = self.open_data_dir()? else {
            return Err(missing());
        };
        let file_name = path.file_name().ok_or_else(missing)?;
        match dir.read_to_string(file_name) {
            Ok(contents) => Ok(contents),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(missing()),
            Err(err) => Err(StoreError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            }),
        }
    }

    fn open_data_dir(&self) -> Result<Option<Dir>, StoreError> {
        match Dir::open_ambient_dir(&self.data_dir, ambient_authority()) {
            Ok(dir) => Ok(Some(dir)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Io {
                path: self.data_dir.clone(),
                message: err.to_string(),
            }),
        }
    }
}

fn write_staged(
    dir: &Dir,
    staging_name: &str,
    file_name: &str,
    contents: &str,
    kind: ValueKind,
) -> io::Result<()> {
    let mut file = create_staging(dir, staging_name, kind)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    drop(file);
    dir.rename(staging_name, dir, file_name)
}

/// Creates the staging file. Secrets get owner-only permissions at creation
/// so no byte is ever written to a more permissive file.
fn create_staging(dir: &Dir, staging_name: &str, kind: ValueKind) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    if kind.is_secret() {
        restrict_to_owner(&mut options);
    }
    dir.open_with(staging_name, &options)
}

#[cfg(unix)]
fn restrict_to_owner(options: &mut OpenOptions) {
    use cap_std::fs::OpenOptionsExt;

    options.mode(0o600);
}

#[cfg(not(unix))]
const fn restrict_to_owner(_options: &mut OpenOptions) {}

fn parse_envelope(path: &Utf8Path, contents: &str) -> Result<RawEnvelope, StoreError> {
    serde_json::from_str(contents).map_err(|err| StoreError::Decode {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
}

fn file_name_for(name: &str) -> Result<String, StoreError> {
    if is_valid_name(name) {
        Ok(format!("{name}{FILE_EXTENSION}"))
    } else {
        Err(StoreError::InvalidName {
            name: name.to_owned(),
        })
    }
}
