//! Durable file catalog tracking record container files and live message
//! bus files.
//!
//! The catalog (`.drot`) holds two interleaved snapshots of its manifest;
//! every mutation bumps the revision and rewrites the stream matching the
//! revision's parity, so a torn write can only ever hurt the snapshot
//! being replaced. On open the higher decodable revision wins.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use chrono::Local;
use dlog_codec::{self as codec, Decode, Encode, Input, ItemKind, Output, VecOutput};
use fslock::LockFile;
use tracing::{debug, trace};

use crate::{
    bus::{lock_with_deadline, recover_bus_file, LOCK_DEADLINE},
    error::{Error, Result},
    sinks::{BasicSinkFrontend, DbFileSinkBackend, DbFileSinkConfig, Sink},
    types::Severity,
};

pub(crate) mod interleaving;

use interleaving::{write_stream, InterleavingInput};

/// File extension of a catalog file.
pub const CATALOG_FILE_EXTENSION: &str = "drot";

/// Magic prefix of a catalog file.
pub const CATALOG_MAGIC: [u8; 17] = [
    0x82, 0x4e, 0x0d, 0x0a, 0xab, 0x7e, 0x7b, 0x64, 0x72, 0x6f, 0x74, 0x7d, 0x7e, 0xbb, 0x0a,
    0x1a, 0xa0,
];

const HEAD_AREA_SIZE: u64 = 2 * interleaving::PAGE_SIZE;
const INITIAL_FILE_SIZE: u64 = 4 * interleaving::PAGE_SIZE;

/// Default name pattern for container files created during bus recovery.
const RECOVERY_FILE_PATTERN: &str = "recovered-{pid}.{ctr}.dlog";

/// Identifier tying record container files to the sink that writes them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FileSinkId(pub u32);

impl FileSinkId {
    pub const DEFAULT: Self = Self(0);
    /// Reserved id under which orphaned bus messages are preserved.
    pub const RECOVERED: Self = Self(u32::MAX);
}

/// Catalog entry describing one record container file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordContainerMeta {
    pub path: PathBuf,
    pub byte_size: u32,
    pub sink_id: FileSinkId,
    pub rotation: u32,
}

impl Encode for RecordContainerMeta {
    fn encoded_size(&self) -> u64 {
        let path = self.path.to_string_lossy();
        1 + self.sink_id.0.encoded_size()
            + self.rotation.encoded_size()
            + self.byte_size.encoded_size()
            + codec::text_size(path.len())
    }

    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> codec::Result<()> {
        let path = self.path.to_string_lossy();
        codec::emit_array(out, 4)?;
        self.sink_id.0.encode(out)?;
        self.rotation.encode(out)?;
        self.byte_size.encode(out)?;
        codec::emit_text(out, &path)
    }
}

impl Decode for RecordContainerMeta {
    fn decode<I: Input + ?Sized>(input: &mut I) -> codec::Result<Self> {
        codec::expect_item_head(input, ItemKind::Array, 4)?;
        let sink_id = FileSinkId(codec::parse_u32(input)?);
        let rotation = codec::parse_u32(input)?;
        let byte_size = codec::parse_u32(input)?;
        let path = PathBuf::from(codec::parse_text(input)?);
        Ok(Self {
            path,
            byte_size,
            sink_id,
            rotation,
        })
    }
}

/// Catalog entry describing one live message bus file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageBusMeta {
    pub path: PathBuf,
    pub magic: Vec<u8>,
    pub id: String,
    pub rotation: u32,
    pub process_id: u32,
}

impl Encode for MessageBusMeta {
    fn encoded_size(&self) -> u64 {
        let path = self.path.to_string_lossy();
        1 + self.magic.encoded_size()
            + self.id.encoded_size()
            + self.rotation.encoded_size()
            + self.process_id.encoded_size()
            + codec::text_size(path.len())
    }

    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> codec::Result<()> {
        let path = self.path.to_string_lossy();
        codec::emit_array(out, 5)?;
        self.magic.encode(out)?;
        self.id.encode(out)?;
        self.rotation.encode(out)?;
        self.process_id.encode(out)?;
        codec::emit_text(out, &path)
    }
}

impl Decode for MessageBusMeta {
    fn decode<I: Input + ?Sized>(input: &mut I) -> codec::Result<Self> {
        codec::expect_item_head(input, ItemKind::Array, 5)?;
        let magic = Vec::<u8>::decode(input)?;
        let id = codec::parse_text(input)?;
        let rotation = codec::parse_u32(input)?;
        let process_id = codec::parse_u32(input)?;
        let path = PathBuf::from(codec::parse_text(input)?);
        Ok(Self {
            path,
            magic,
            id,
            rotation,
            process_id,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Contents {
    revision: u64,
    record_containers: Vec<RecordContainerMeta>,
    message_buses: Vec<MessageBusMeta>,
}

impl Encode for Contents {
    fn encoded_size(&self) -> u64 {
        let containers: u64 = self
            .record_containers
            .iter()
            .map(Encode::encoded_size)
            .sum();
        let buses: u64 = self.message_buses.iter().map(Encode::encoded_size).sum();
        1 + 1
            + self.revision.encoded_size()
            + 1
            + codec::posint_head_size(self.record_containers.len() as u64) as u64
            + containers
            + 1
            + codec::posint_head_size(self.message_buses.len() as u64) as u64
            + buses
    }

    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> codec::Result<()> {
        codec::emit_map(out, 3)?;
        codec::emit_uint(out, 1)?;
        self.revision.encode(out)?;
        codec::emit_uint(out, 2)?;
        codec::emit_array(out, self.record_containers.len() as u64)?;
        for container in &self.record_containers {
            container.encode(out)?;
        }
        codec::emit_uint(out, 3)?;
        codec::emit_array(out, self.message_buses.len() as u64)?;
        for bus in &self.message_buses {
            bus.encode(out)?;
        }
        Ok(())
    }
}

impl Decode for Contents {
    fn decode<I: Input + ?Sized>(input: &mut I) -> codec::Result<Self> {
        let pairs = codec::parse_map_head(input)?;
        let mut contents = Contents::default();
        for _ in 0..pairs {
            match codec::parse_u64(input)? {
                1 => contents.revision = codec::parse_u64(input)?,
                2 => {
                    let len = codec::parse_array_head(input)?;
                    for _ in 0..len {
                        contents
                            .record_containers
                            .push(RecordContainerMeta::decode(input)?);
                    }
                }
                3 => {
                    let len = codec::parse_array_head(input)?;
                    for _ in 0..len {
                        contents.message_buses.push(MessageBusMeta::decode(input)?);
                    }
                }
                _ => codec::skip_item(input)?,
            }
        }
        Ok(contents)
    }
}

/// A freshly created, registered record container file.
pub struct CreatedContainer {
    pub file: File,
    pub path: PathBuf,
    pub rotation: u32,
}

/// A freshly created, registered message bus file.
pub struct CreatedMessageBus {
    pub file: File,
    pub path: PathBuf,
    pub rotation: u32,
}

/// Durable manifest of record container and message bus files.
///
/// Every handle keeps its own file descriptor and manifest cache; writers
/// re-fetch under the advisory lock before mutating, so independently
/// cloned handles stay coherent.
pub struct FileDatabase {
    path: PathBuf,
    dir: PathBuf,
    file: File,
    contents: Contents,
}

impl FileDatabase {
    /// Opens or creates the catalog at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let dir = match path.parent() {
            Some(parent) if parent != Path::new("") => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut db = Self {
            path,
            dir,
            file,
            contents: Contents::default(),
        };

        {
            let _lock = db.lock()?;
            if db.file.metadata()?.len() != 0 {
                db.validate_magic()?;
                db.fetch_content_impl()?;
            } else {
                db.initialize_storage()?;
            }
        }

        Ok(db)
    }

    /// Opens an independent handle onto the same catalog.
    pub fn try_clone(&self) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?;
        Ok(Self {
            path: self.path.clone(),
            dir: self.dir.clone(),
            file,
            contents: self.contents.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record container entries as of the last fetch.
    pub fn record_containers(&self) -> &[RecordContainerMeta] {
        &self.contents.record_containers
    }

    /// Message bus entries as of the last fetch.
    pub fn message_buses(&self) -> &[MessageBusMeta] {
        &self.contents.message_buses
    }

    fn lock(&self) -> Result<LockFile> {
        lock_with_deadline(&self.path, LOCK_DEADLINE)
    }

    fn validate_magic(&mut self) -> Result<()> {
        let mut head = vec![0u8; HEAD_AREA_SIZE as usize];
        self.file.seek(SeekFrom::Start(0))?;
        if self.file.read_exact(&mut head).is_err() {
            return Err(Error::MissingData);
        }
        if head[..CATALOG_MAGIC.len()] != CATALOG_MAGIC {
            return Err(Error::InvalidFileDatabaseHeader);
        }
        if head[CATALOG_MAGIC.len()..].iter().any(|&b| b != 0) {
            return Err(Error::InvalidFileDatabaseHeader);
        }
        Ok(())
    }

    fn initialize_storage(&mut self) -> Result<()> {
        self.file.set_len(INITIAL_FILE_SIZE)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&CATALOG_MAGIC)?;
        self.retire_to_storage()?;
        debug!(path = %self.path.display(), "Initialized catalog storage.");
        Ok(())
    }

    /// Reloads the manifest from disk, keeping the higher revision.
    pub fn fetch_content(&mut self) -> Result<()> {
        let _lock = self.lock()?;
        self.fetch_content_impl()
    }

    fn fetch_content_impl(&mut self) -> Result<()> {
        let mut winner_odd = self.contents.revision & 1 == 1;
        let mut first_valid = false;

        {
            let mut input = InterleavingInput::new(&self.file, false);
            if let Ok(decoded) = Contents::decode(&mut input) {
                first_valid = true;
                if self.contents.revision <= decoded.revision {
                    self.contents = decoded;
                    winner_odd = false;
                }
            }
        }

        let mut input = InterleavingInput::new(&self.file, true);
        match Contents::decode(&mut input) {
            Ok(decoded) => {
                if self.contents.revision < decoded.revision {
                    self.contents = decoded;
                    winner_odd = true;
                }
            }
            // Partial corruption of one stream is survivable; losing both
            // means the manifest is gone.
            Err(_) if !first_valid => return Err(Error::InvalidFileDatabaseHeader),
            Err(_) => {}
        }

        // Align the revision parity so the next retire lands on the
        // stream opposite the winning one.
        if (self.contents.revision & 1 == 1) != winner_odd {
            self.contents.revision += 1;
        }
        Ok(())
    }

    fn retire_to_storage(&mut self) -> Result<()> {
        let mut out = VecOutput::new();
        self.contents.encode(&mut out)?;
        write_stream(&self.file, self.contents.revision & 1 == 1, out.as_slice())?;
        trace!(
            path = %self.path.display(),
            revision = self.contents.revision,
            containers = self.contents.record_containers.len(),
            buses = self.contents.message_buses.len(),
            "Retired catalog manifest."
        );
        Ok(())
    }

    /// Creates a record container file from `pattern` and registers it.
    ///
    /// The rotation number continues from the highest one recorded for
    /// `sink_id`. Name collisions are retried up to five times, stepping
    /// the rotation by two to preserve its parity.
    pub fn create_record_container(
        &mut self,
        pattern: &str,
        sink_id: FileSinkId,
    ) -> Result<CreatedContainer> {
        let _lock = self.lock()?;
        self.fetch_content_impl()?;

        let mut contents = self.contents.clone();
        contents.revision += 1;

        let last_rotation = contents
            .record_containers
            .iter()
            .filter(|meta| meta.sink_id == sink_id)
            .map(|meta| meta.rotation)
            .max()
            .unwrap_or(0);
        let mut rotation = last_rotation + 1;

        let (file, name) = loop {
            let name = expand_pattern(
                pattern,
                &PatternArgs {
                    id: &sink_id.0.to_string(),
                    ctr: rotation,
                },
            )?;
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(self.dir.join(&name))
            {
                Ok(file) => break (file, name),
                Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                    // Five retries, hoping the pattern disambiguates by
                    // timestamp or rotation count.
                    if rotation.wrapping_sub(last_rotation) < 10 {
                        rotation += 2;
                    } else {
                        return Err(error.into());
                    }
                }
                Err(error) => return Err(error.into()),
            }
        };

        contents.record_containers.push(RecordContainerMeta {
            path: PathBuf::from(&name),
            byte_size: 0,
            sink_id,
            rotation,
        });

        let full_path = self.dir.join(&name);
        self.contents = contents;
        if let Err(error) = self.retire_to_storage() {
            let _ = std::fs::remove_file(&full_path);
            // Roll the cache back to what is actually on disk.
            let _ = self.fetch_content_impl();
            return Err(error);
        }

        debug!(
            path = %full_path.display(),
            sink_id = sink_id.0,
            rotation,
            "Registered record container."
        );
        Ok(CreatedContainer {
            file,
            path: full_path,
            rotation,
        })
    }

    /// Opens a registered record container for reading.
    pub fn open_record_container(&self, meta: &RecordContainerMeta) -> Result<File> {
        Ok(OpenOptions::new()
            .read(true)
            .open(self.dir.join(&meta.path))?)
    }

    /// Rewrites the recorded byte size of a container entry.
    pub fn update_record_container_size(
        &mut self,
        sink_id: FileSinkId,
        rotation: u32,
        byte_size: u32,
    ) -> Result<()> {
        let _lock = self.lock()?;
        self.fetch_content_impl()?;

        let mut contents = self.contents.clone();
        contents.revision += 1;
        let entry = contents
            .record_containers
            .iter_mut()
            .find(|meta| meta.sink_id == sink_id && meta.rotation == rotation)
            .ok_or(Error::UnknownSink)?;
        entry.byte_size = byte_size;

        self.contents = contents;
        self.retire_to_storage()
    }

    /// Creates a message bus file from `pattern` and registers it along
    /// with its magic and the calling process id.
    pub fn create_message_bus(
        &mut self,
        pattern: &str,
        id: String,
        magic: &[u8],
    ) -> Result<CreatedMessageBus> {
        let _lock = self.lock()?;
        self.fetch_content_impl()?;

        let mut contents = self.contents.clone();
        contents.revision += 1;

        let last_rotation = contents
            .message_buses
            .iter()
            .filter(|meta| meta.id == id)
            .map(|meta| meta.rotation)
            .max()
            .unwrap_or(0);
        let mut rotation = last_rotation + 1;

        let (file, name) = loop {
            let name = expand_pattern(
                pattern,
                &PatternArgs {
                    id: &id,
                    ctr: rotation,
                },
            )?;
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(self.dir.join(&name))
            {
                Ok(file) => break (file, name),
                Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                    if rotation.wrapping_sub(last_rotation) < 10 {
                        rotation += 2;
                    } else {
                        return Err(error.into());
                    }
                }
                Err(error) => return Err(error.into()),
            }
        };

        contents.message_buses.push(MessageBusMeta {
            path: PathBuf::from(&name),
            magic: magic.to_vec(),
            id: id.clone(),
            rotation,
            process_id: std::process::id(),
        });

        let full_path = self.dir.join(&name);
        self.contents = contents;
        if let Err(error) = self.retire_to_storage() {
            let _ = std::fs::remove_file(&full_path);
            let _ = self.fetch_content_impl();
            return Err(error);
        }

        debug!(path = %full_path.display(), id = %id, rotation, "Registered message bus.");
        Ok(CreatedMessageBus {
            file,
            path: full_path,
            rotation,
        })
    }

    /// Drops the registration of a message bus.
    pub fn remove_message_bus(&mut self, id: &str, rotation: u32) -> Result<()> {
        let _lock = self.lock()?;
        self.fetch_content_impl()?;

        let mut contents = self.contents.clone();
        contents.revision += 1;
        contents
            .message_buses
            .retain(|meta| !(meta.id == id && meta.rotation == rotation));

        self.contents = contents;
        self.retire_to_storage()
    }

    /// Recovers messages from buses whose owning process died.
    ///
    /// For every registered bus file that still exists, an exclusive lock
    /// probe decides liveness: if the lock can be taken, the previous
    /// owner is gone, and the remaining messages are drained into a
    /// catalog-tracked file sink under [`FileSinkId::RECOVERED`] before
    /// the bus file is unlinked. Buses whose file is already gone are
    /// pruned; buses still locked by a live process are left alone.
    pub fn prune_message_buses(&mut self, sink_file_pattern: Option<&str>) -> Result<()> {
        let pattern = sink_file_pattern.unwrap_or(RECOVERY_FILE_PATTERN);

        self.fetch_content()?;
        let buses = self.contents.message_buses.clone();

        for bus in buses {
            let full_path = self.dir.join(&bus.path);
            if !full_path.exists() {
                debug!(path = %full_path.display(), id = %bus.id, "Pruning vanished bus entry.");
                self.remove_message_bus(&bus.id, bus.rotation)?;
                continue;
            }

            let alive = {
                let mut probe = LockFile::open(&full_path)?;
                !probe.try_lock()?
            };
            if alive {
                trace!(path = %full_path.display(), id = %bus.id, "Bus still owned; keeping.");
                continue;
            }

            debug!(path = %full_path.display(), id = %bus.id, "Recovering orphaned bus.");
            self.recover_orphaned_bus(&full_path, pattern)?;
            self.remove_message_bus(&bus.id, bus.rotation)?;
        }

        Ok(())
    }

    fn recover_orphaned_bus(&mut self, bus_path: &Path, pattern: &str) -> Result<()> {
        let backend = DbFileSinkBackend::new(DbFileSinkConfig {
            database: self.try_clone()?,
            file_name_pattern: pattern.to_string(),
            sink_id: FileSinkId::RECOVERED,
            max_file_size: u64::MAX,
            target_buffer_size: 0,
            attributes: Default::default(),
        })?;
        let mut sink = BasicSinkFrontend::new(Severity::TRACE, backend);

        recover_bus_file(bus_path, &mut |msgs| {
            let (binary_size, parses) = crate::fabric::preparse_messages(msgs);
            let _ = sink.try_consume(binary_size, &parses);
        })?;

        if !sink.try_finalize() {
            return Err(Error::SinkFinalizationFailed);
        }
        Ok(())
    }

    /// Best-effort unlink of all referenced record container files.
    ///
    /// Entries whose file could be removed (or is already gone) are
    /// pruned from the manifest; the rest are kept and reported.
    pub fn unlink_all_record_containers(&mut self) -> Result<()> {
        let _lock = self.lock()?;
        self.fetch_content_impl()?;
        let mut contents = self.contents.clone();
        contents.revision += 1;
        self.unlink_all_record_containers_impl(&mut contents);
        let failed = !contents.record_containers.is_empty();
        self.contents = contents;
        self.retire_to_storage()?;
        if failed {
            return Err(Error::ContainerUnlinkFailed);
        }
        Ok(())
    }

    fn unlink_all_record_containers_impl(&self, contents: &mut Contents) {
        contents.record_containers.retain(|meta| {
            let full_path = self.dir.join(&meta.path);
            if !full_path.exists() {
                return false;
            }
            std::fs::remove_file(&full_path).is_err()
        });
    }

    /// Best-effort unlink of all referenced message bus files.
    pub fn unlink_all_message_buses(&mut self) -> Result<()> {
        let _lock = self.lock()?;
        self.fetch_content_impl()?;
        let mut contents = self.contents.clone();
        contents.revision += 1;
        self.unlink_all_message_buses_impl(&mut contents);
        let failed = !contents.message_buses.is_empty();
        self.contents = contents;
        self.retire_to_storage()?;
        if failed {
            return Err(Error::MessageBusUnlinkFailed);
        }
        Ok(())
    }

    fn unlink_all_message_buses_impl(&self, contents: &mut Contents) {
        contents.message_buses.retain(|meta| {
            let full_path = self.dir.join(&meta.path);
            if !full_path.exists() {
                return false;
            }
            std::fs::remove_file(&full_path).is_err()
        });
    }

    /// Unlinks every referenced file and finally the catalog itself.
    pub fn unlink_all(mut self) -> Result<()> {
        {
            let _lock = self.lock()?;
            self.fetch_content_impl()?;

            let mut contents = self.contents.clone();
            contents.revision += 1;
            self.unlink_all_record_containers_impl(&mut contents);
            self.unlink_all_message_buses_impl(&mut contents);

            let containers_left = !contents.record_containers.is_empty();
            let buses_left = !contents.message_buses.is_empty();
            self.contents = contents;
            let _ = self.retire_to_storage();

            if containers_left {
                return Err(Error::ContainerUnlinkFailed);
            }
            if buses_left {
                return Err(Error::MessageBusUnlinkFailed);
            }
        }

        std::fs::remove_file(&self.path).map_err(|_| Error::ContainerUnlinkFailed)?;
        Ok(())
    }
}

struct PatternArgs<'a> {
    id: &'a str,
    ctr: u32,
}

/// Expands the `{id}`, `{ctr}`, `{pid}` and `{now[:STRFTIME]}` name
/// pattern placeholders. `{{` and `}}` escape literal braces; anything
/// else is rejected.
fn expand_pattern(pattern: &str, args: &PatternArgs<'_>) -> Result<String> {
    let mut expanded = String::with_capacity(pattern.len() + 16);
    let mut chars = pattern.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                expanded.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                expanded.push('}');
            }
            '{' => {
                let mut placeholder = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(inner) => placeholder.push(inner),
                        None => return Err(Error::InvalidArgument),
                    }
                }
                let (name, spec) = match placeholder.split_once(':') {
                    Some((name, spec)) => (name, Some(spec)),
                    None => (placeholder.as_str(), None),
                };
                match (name, spec) {
                    ("id", None) => expanded.push_str(args.id),
                    ("ctr", None) => expanded.push_str(&args.ctr.to_string()),
                    ("pid", None) => expanded.push_str(&std::process::id().to_string()),
                    ("now", spec) => {
                        let format = spec.unwrap_or("%FT%H-%M-%S");
                        let items: Vec<chrono::format::Item<'_>> =
                            chrono::format::StrftimeItems::new(format).collect();
                        if items.iter().any(|item| matches!(item, chrono::format::Item::Error)) {
                            return Err(Error::InvalidArgument);
                        }
                        expanded.push_str(
                            &Local::now().format_with_items(items.iter().cloned()).to_string(),
                        );
                    }
                    _ => return Err(Error::InvalidArgument),
                }
            }
            '}' => return Err(Error::InvalidArgument),
            other => expanded.push(other),
        }
    }

    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use temp_dir::TempDir;

    use super::*;

    fn args<'a>(id: &'a str, ctr: u32) -> PatternArgs<'a> {
        PatternArgs { id, ctr }
    }

    #[test]
    fn pattern_placeholders_expand() {
        let name = expand_pattern("log.{id}.{ctr}.dlog", &args("std", 3)).unwrap();
        assert_eq!(name, "log.std.3.dlog");

        let pid = std::process::id().to_string();
        let name = expand_pattern("{id}_{pid}", &args("7", 0)).unwrap();
        assert_eq!(name, format!("7_{pid}"));

        let name = expand_pattern("{{literal}}.{ctr}", &args("x", 9)).unwrap();
        assert_eq!(name, "{literal}.9");

        let name = expand_pattern("{now:%Y}", &args("x", 0)).unwrap();
        assert_eq!(name.len(), 4);
        assert!(name.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn unknown_placeholders_are_rejected() {
        assert!(matches!(
            expand_pattern("{bogus}", &args("x", 0)),
            Err(Error::InvalidArgument)
        ));
        assert!(matches!(
            expand_pattern("dangling{", &args("x", 0)),
            Err(Error::InvalidArgument)
        ));
        assert!(matches!(
            expand_pattern("dangling}", &args("x", 0)),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn open_initializes_and_validates_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs.drot");
        {
            let db = FileDatabase::open(&path).unwrap();
            assert!(db.record_containers().is_empty());
            assert!(db.message_buses().is_empty());
        }

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..CATALOG_MAGIC.len()], &CATALOG_MAGIC);
        assert!(bytes[CATALOG_MAGIC.len()..HEAD_AREA_SIZE as usize]
            .iter()
            .all(|&b| b == 0));

        // A second open validates rather than re-initializes.
        FileDatabase::open(&path).unwrap();
    }

    #[test]
    fn corrupt_magic_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs.drot");
        FileDatabase::open(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[3] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            FileDatabase::open(&path),
            Err(Error::InvalidFileDatabaseHeader)
        ));
    }

    #[test]
    fn registrations_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs.drot");

        {
            let mut db = FileDatabase::open(&path).unwrap();
            let created = db
                .create_record_container("container.{id}.{ctr}.dlog", FileSinkId::DEFAULT)
                .unwrap();
            assert_eq!(created.rotation, 1);
            let created = db
                .create_message_bus("bus.{id}.{ctr}.dmpscb", "std".to_owned(), &[0xab, 0xcd])
                .unwrap();
            assert_eq!(created.rotation, 1);
        }

        let db = FileDatabase::open(&path).unwrap();
        assert_eq!(db.record_containers().len(), 1);
        let container = &db.record_containers()[0];
        assert_eq!(container.sink_id, FileSinkId::DEFAULT);
        assert_eq!(container.rotation, 1);
        assert_eq!(container.path, PathBuf::from("container.0.1.dlog"));

        assert_eq!(db.message_buses().len(), 1);
        let bus = &db.message_buses()[0];
        assert_eq!(bus.id, "std");
        assert_eq!(bus.magic, vec![0xab, 0xcd]);
        assert_eq!(bus.process_id, std::process::id());
    }

    #[test]
    fn rotation_numbers_increase_per_sink() {
        let dir = TempDir::new().unwrap();
        let mut db = FileDatabase::open(dir.path().join("logs.drot")).unwrap();

        for expected in 1..=3u32 {
            let created = db
                .create_record_container("c.{id}.{ctr}.dlog", FileSinkId(7))
                .unwrap();
            assert_eq!(created.rotation, expected);
        }
        let created = db
            .create_record_container("c.{id}.{ctr}.dlog", FileSinkId(8))
            .unwrap();
        assert_eq!(created.rotation, 1);
    }

    #[test]
    fn collisions_step_the_rotation_by_two() {
        let dir = TempDir::new().unwrap();
        let mut db = FileDatabase::open(dir.path().join("logs.drot")).unwrap();

        // Occupy the name the next rotation would pick.
        std::fs::write(dir.path().join("c.0.1.dlog"), b"").unwrap();
        let created = db
            .create_record_container("c.{id}.{ctr}.dlog", FileSinkId::DEFAULT)
            .unwrap();
        assert_eq!(created.rotation, 3);
    }

    #[test]
    fn update_size_is_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs.drot");
        let mut db = FileDatabase::open(&path).unwrap();
        let created = db
            .create_record_container("c.{id}.{ctr}.dlog", FileSinkId::DEFAULT)
            .unwrap();
        db.update_record_container_size(FileSinkId::DEFAULT, created.rotation, 4711)
            .unwrap();

        let db = FileDatabase::open(&path).unwrap();
        assert_eq!(db.record_containers()[0].byte_size, 4711);
    }

    #[test]
    fn one_corrupt_stream_does_not_lose_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs.drot");
        let mut db = FileDatabase::open(&path).unwrap();
        db.create_record_container("c.{id}.{ctr}.dlog", FileSinkId::DEFAULT)
            .unwrap();
        let expected = db.record_containers().to_vec();
        let winning_odd = db.contents.revision & 1 == 1;
        drop(db);
        let pristine = std::fs::read(&path).unwrap();

        // Tearing the stale stream must not affect the contents at all.
        let mut bytes = pristine.clone();
        let offset = interleaving::block_offset(0, !winning_odd) as usize;
        for byte in &mut bytes[offset..offset + 16] {
            *byte = 0xff;
        }
        std::fs::write(&path, &bytes).unwrap();
        let db = FileDatabase::open(&path).unwrap();
        assert_eq!(db.record_containers(), expected.as_slice());
        drop(db);

        // Tearing the winning stream falls back to the stale snapshot,
        // losing only the torn revision.
        let mut bytes = pristine;
        let offset = interleaving::block_offset(0, winning_odd) as usize;
        for byte in &mut bytes[offset..offset + 16] {
            *byte = 0xff;
        }
        std::fs::write(&path, &bytes).unwrap();
        let db = FileDatabase::open(&path).unwrap();
        assert!(db.record_containers().len() < expected.len());
    }

    #[test]
    fn both_streams_corrupt_is_a_header_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs.drot");
        drop(FileDatabase::open(&path).unwrap());

        let mut bytes = std::fs::read(&path).unwrap();
        for odd in [false, true] {
            let offset = interleaving::block_offset(0, odd) as usize;
            for byte in &mut bytes[offset..offset + 16] {
                *byte = 0xff;
            }
        }
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            FileDatabase::open(&path),
            Err(Error::InvalidFileDatabaseHeader)
        ));
    }

    #[test]
    fn unlink_all_removes_everything() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs.drot");
        let mut db = FileDatabase::open(&path).unwrap();
        let container = db
            .create_record_container("c.{id}.{ctr}.dlog", FileSinkId::DEFAULT)
            .unwrap();
        let bus = db
            .create_message_bus("b.{id}.{ctr}.dmpscb", "std".to_owned(), &[])
            .unwrap();
        let container_path = container.path.clone();
        let bus_path = bus.path.clone();
        drop(container);
        drop(bus);

        db.unlink_all().unwrap();
        assert!(!container_path.exists());
        assert!(!bus_path.exists());
        assert!(!path.exists());
    }
}
