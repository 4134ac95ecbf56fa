//! Directory-tree persistence engine: one global header, a definitions side
//! file per table, and one subdirectory per process / per thread, as laid
//! out in the on-disk format. Everything here composes `io_utils`'s LE
//! primitives with `codec`'s encode/decode pipeline; the entity formats
//! (Event/Sequence/Loop/Definitions) are all fixed-size-prefix-then-payload,
//! matching the rest of the wire format.

use crate::archive::{Archive, ArchiveId, GlobalArchive};
use crate::definitions::{
    AttributeDef, AttributeType, CommDef, Definitions, DefinitionTable, GroupDef, LocationDef,
    LocationGroupDef, Ref, RegionDef, StringDef,
};
use crate::event::{Event, EventSummary};
use crate::io_utils::{
    read_bytes, read_string, read_u16, read_u32, read_u64, read_u8, read_usize, write_string,
    write_u16, write_u32, write_u64, write_u8, write_usize,
};
use crate::linked_vector::LinkedDurationVector;
use crate::params::{Parameters, TimestampStorage};
use crate::sequence::{hash_tokens, Loop, Sequence};
use crate::thread::{Thread, ThreadId};
use crate::token::Token;
use crate::{PallasError, Result, ABI_VERSION};
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;

/// Sentinel written in place of an absent `Option<Ref>`.
const NONE_REF: u32 = u32::MAX;

fn write_opt_ref<W: Write>(w: &mut W, r: Option<Ref>) -> Result<()> {
    write_u32(w, r.unwrap_or(NONE_REF))
}

fn read_opt_ref<R: Read>(r: &mut R) -> Result<Option<Ref>> {
    let v = read_u32(r)?;
    Ok((v != NONE_REF).then_some(v))
}

/// Handle to the on-disk layout of a single trace. All operations are
/// plain directory-tree reads/writes; there is no in-process caching beyond
/// what `LinkedVector`'s lazy payload loading already does.
pub struct Storage;

impl Storage {
    /// Serialises `global` (and every Archive/Thread reachable from it)
    /// into `<dir>/`, creating directories as needed. `dir` is created if
    /// missing (`mkdir -p` semantics).
    pub fn write(dir: impl AsRef<Path>, trace_name: &str, global: &GlobalArchive, params: &Parameters) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let archives = global.archives();
        let global_defs_sizes = global.with_definitions(table_sizes);
        write_global_header(
            &dir.join(format!("{trace_name}.pallas")),
            global.group_id,
            params,
            global_defs_sizes,
            archives.len() as u32,
        )?;
        global.with_definitions(|defs| write_definitions(dir, defs))?;

        for archive in &archives {
            Self::write_archive(dir, archive, params)?;
        }
        Ok(())
    }

    fn write_archive(trace_dir: &Path, archive: &Archive, params: &Parameters) -> Result<()> {
        let archive_dir = trace_dir.join(format!("archive_{}", archive.id.0));
        fs::create_dir_all(&archive_dir)?;

        let sizes = archive.with_definitions(table_sizes);
        write_process_header(&archive_dir.join("archive.pallas"), sizes, archive.with_threads(|t| t.len() as u32))?;
        archive.with_definitions(|defs| write_definitions(&archive_dir, defs))?;

        archive.with_threads(|threads| {
            for thread in threads {
                write_thread(&archive_dir.join(format!("thread_{}", thread.id.0)), thread, archive.id, params)?;
            }
            Ok(())
        })
    }

    /// Reconstructs a `GlobalArchive` (with every Archive and Thread it
    /// owned) plus the `Parameters` it was written with, from `<dir>/`.
    pub fn read(dir: impl AsRef<Path>, trace_name: &str) -> Result<(Arc<GlobalArchive>, Parameters)> {
        let dir = dir.as_ref();
        let (group_id, params, _sizes, nb_archives) = read_global_header(&dir.join(format!("{trace_name}.pallas")))?;

        let global = GlobalArchive::new(group_id);
        read_definitions(dir, |table, reference, value| insert_definition(global.as_ref(), table, reference, value))?;

        for id in 0..nb_archives {
            let archive_id = ArchiveId(id);
            let archive_dir = dir.join(format!("archive_{id}"));
            let (_sizes, nb_threads) = read_process_header(&archive_dir.join("archive.pallas"))?;
            let archive = global.open_archive(archive_id);
            read_definitions(&archive_dir, |table, reference, value| {
                insert_definition(archive.as_ref(), table, reference, value)
            })?;
            for tid in 0..nb_threads {
                let thread_dir = archive_dir.join(format!("thread_{tid}"));
                let thread = read_thread(&thread_dir, &params)?;
                archive.add_thread(thread);
            }
        }

        Ok((global, params))
    }
}

/// Either a `GlobalArchive` or an `Archive`, the two places Definitions
/// live. Lets `read_definitions` insert into whichever without duplicating
/// the loop over all seven tables.
trait DefinitionSink {
    fn string(&self, r: Ref, v: StringDef) -> Result<()>;
    fn region(&self, r: Ref, v: RegionDef) -> Result<()>;
    fn attribute(&self, r: Ref, v: AttributeDef) -> Result<()>;
    fn group(&self, r: Ref, v: GroupDef) -> Result<()>;
    fn comm(&self, r: Ref, v: CommDef) -> Result<()>;
    fn location(&self, r: Ref, v: LocationDef) -> Result<()>;
    fn location_group(&self, r: Ref, v: LocationGroupDef) -> Result<()>;
}

impl DefinitionSink for GlobalArchive {
    fn string(&self, r: Ref, v: StringDef) -> Result<()> {
        self.add_string(r, v.bytes)
    }
    fn region(&self, r: Ref, v: RegionDef) -> Result<()> {
        self.add_region(r, v.string_ref)
    }
    fn attribute(&self, r: Ref, v: AttributeDef) -> Result<()> {
        self.add_attribute(r, v.name, v.description, v.attr_type)
    }
    fn group(&self, r: Ref, v: GroupDef) -> Result<()> {
        self.add_group(r, v.name, v.members)
    }
    fn comm(&self, r: Ref, v: CommDef) -> Result<()> {
        self.add_comm(r, v.name, v.group, v.parent)
    }
    fn location(&self, r: Ref, v: LocationDef) -> Result<()> {
        self.define_location(r, v.name, v.parent_group)
    }
    fn location_group(&self, r: Ref, v: LocationGroupDef) -> Result<()> {
        self.define_location_group(r, v.name, v.parent, v.main_location)
    }
}

impl DefinitionSink for Archive {
    fn string(&self, r: Ref, v: StringDef) -> Result<()> {
        self.add_string(r, v.bytes)
    }
    fn region(&self, r: Ref, v: RegionDef) -> Result<()> {
        self.add_region(r, v.string_ref)
    }
    fn attribute(&self, r: Ref, v: AttributeDef) -> Result<()> {
        self.add_attribute(r, v.name, v.description, v.attr_type)
    }
    fn group(&self, r: Ref, v: GroupDef) -> Result<()> {
        self.add_group(r, v.name, v.members)
    }
    fn comm(&self, r: Ref, v: CommDef) -> Result<()> {
        self.add_comm(r, v.name, v.group, v.parent)
    }
    fn location(&self, r: Ref, v: LocationDef) -> Result<()> {
        self.define_location(r, v.name, v.parent_group)
    }
    fn location_group(&self, r: Ref, v: LocationGroupDef) -> Result<()> {
        self.define_location_group(r, v.name, v.parent, v.main_location)
    }
}

fn insert_definition(
    sink: &impl DefinitionSink,
    table: DefKind,
    reference: Ref,
    bytes: &[u8],
) -> Result<()> {
    let mut cursor = Cursor::new(bytes);
    match table {
        DefKind::String => {
            let len = read_usize(&mut cursor)?;
            sink.string(reference, StringDef { bytes: read_string(&mut cursor, len)? })
        }
        DefKind::Region => sink.region(reference, RegionDef { string_ref: read_u32(&mut cursor)? }),
        DefKind::Attribute => {
            let name = read_u32(&mut cursor)?;
            let description = read_u32(&mut cursor)?;
            let attr_type = attribute_type_from_u8(read_u8(&mut cursor)?)?;
            sink.attribute(reference, AttributeDef { name, description, attr_type })
        }
        DefKind::Group => {
            let name = read_u32(&mut cursor)?;
            let n = read_usize(&mut cursor)?;
            let mut members = Vec::with_capacity(n);
            for _ in 0..n {
                members.push(read_u32(&mut cursor)?);
            }
            sink.group(reference, GroupDef { name, members })
        }
        DefKind::Comm => {
            let name = read_u32(&mut cursor)?;
            let group = read_u32(&mut cursor)?;
            let parent = read_opt_ref(&mut cursor)?;
            sink.comm(reference, CommDef { name, group, parent })
        }
        DefKind::Location => {
            let name = read_u32(&mut cursor)?;
            let parent_group = read_u32(&mut cursor)?;
            sink.location(reference, LocationDef { name, parent_group })
        }
        DefKind::LocationGroup => {
            let name = read_u32(&mut cursor)?;
            let parent = read_opt_ref(&mut cursor)?;
            let main_location = read_opt_ref(&mut cursor)?;
            sink.location_group(reference, LocationGroupDef { name, parent, main_location })
        }
    }
}

fn attribute_type_from_u8(tag: u8) -> Result<AttributeType> {
    Ok(match tag {
        0 => AttributeType::None,
        1 => AttributeType::Uint8,
        2 => AttributeType::Uint16,
        3 => AttributeType::Uint32,
        4 => AttributeType::Uint64,
        5 => AttributeType::Int8,
        6 => AttributeType::Int16,
        7 => AttributeType::Int32,
        8 => AttributeType::Int64,
        9 => AttributeType::Float,
        10 => AttributeType::Double,
        11 => AttributeType::String,
        other => return Err(PallasError::Corruption(format!("unknown attribute type tag {other}"))),
    })
}

#[derive(Clone, Copy)]
enum DefKind {
    String,
    Region,
    Attribute,
    Group,
    Comm,
    Location,
    LocationGroup,
}

/// `(strings, regions, attributes, groups, comms, locations, location_groups)`.
fn table_sizes(defs: &Definitions) -> [u32; 7] {
    [
        defs.strings.len() as u32,
        defs.regions.len() as u32,
        defs.attributes.len() as u32,
        defs.groups.len() as u32,
        defs.comms.len() as u32,
        defs.locations.len() as u32,
        defs.location_groups.len() as u32,
    ]
}

fn write_global_header(path: &Path, group_id: u32, params: &Parameters, sizes: [u32; 7], nb_archives: u32) -> Result<()> {
    let mut buf = Vec::new();
    write_u32(&mut buf, group_id)?;
    write_u8(&mut buf, ABI_VERSION)?;
    write_parameters(&mut buf, params)?;
    for s in sizes {
        write_u32(&mut buf, s)?;
    }
    write_u32(&mut buf, nb_archives)?;
    write_u8(&mut buf, 1)?; // STORE_HASHING: sequence hashes are always persisted
    write_u8(&mut buf, (params.timestamp_storage != TimestampStorage::None) as u8)?;
    fs::write(path, buf)?;
    Ok(())
}

fn read_global_header(path: &Path) -> Result<(u32, Parameters, [u32; 7], u32)> {
    let bytes = fs::read(path)?;
    let mut cursor = Cursor::new(bytes);
    let group_id = read_u32(&mut cursor)?;
    let version = read_u8(&mut cursor)?;
    if version != ABI_VERSION {
        return Err(PallasError::AbiMismatch { found: version, expected: ABI_VERSION });
    }
    let params = read_parameters(&mut cursor)?;
    let mut sizes = [0u32; 7];
    for s in &mut sizes {
        *s = read_u32(&mut cursor)?;
    }
    let nb_archives = read_u32(&mut cursor)?;
    let _store_hashing = read_u8(&mut cursor)? != 0;
    let _store_timestamps = read_u8(&mut cursor)? != 0;
    Ok((group_id, params, sizes, nb_archives))
}

fn write_process_header(path: &Path, sizes: [u32; 7], nb_threads: u32) -> Result<()> {
    let mut buf = Vec::new();
    for s in sizes {
        write_u32(&mut buf, s)?;
    }
    write_u32(&mut buf, nb_threads)?;
    fs::write(path, buf)?;
    Ok(())
}

fn read_process_header(path: &Path) -> Result<([u32; 7], u32)> {
    let bytes = fs::read(path)?;
    let mut cursor = Cursor::new(bytes);
    let mut sizes = [0u32; 7];
    for s in &mut sizes {
        *s = read_u32(&mut cursor)?;
    }
    let nb_threads = read_u32(&mut cursor)?;
    Ok((sizes, nb_threads))
}

fn write_parameters<W: Write>(w: &mut W, params: &Parameters) -> Result<()> {
    write_u8(w, params.compression_algorithm as u8)?;
    write_u8(w, params.encoding_algorithm as u8)?;
    write_u8(w, params.zstd_compression_level)?;
    write_u8(w, params.loop_finding_algorithm as u8)?;
    write_u64(w, params.max_loop_length)?;
    write_u8(w, params.timestamp_storage as u8)?;
    write_u8(w, params.debug_level as u8)?;
    Ok(())
}

fn read_parameters<R: Read>(r: &mut R) -> Result<Parameters> {
    use crate::params::{CompressionAlgorithm, DebugLevel, EncodingAlgorithm, LoopFindingAlgorithm};
    let compression_algorithm = match read_u8(r)? {
        1 => CompressionAlgorithm::Zstd,
        2 => CompressionAlgorithm::Histogram,
        3 => CompressionAlgorithm::Zfp,
        4 => CompressionAlgorithm::Sz,
        _ => CompressionAlgorithm::None,
    };
    let encoding_algorithm = match read_u8(r)? {
        1 => EncodingAlgorithm::Masking,
        _ => EncodingAlgorithm::None,
    };
    let zstd_compression_level = read_u8(r)?;
    let loop_finding_algorithm = match read_u8(r)? {
        1 => LoopFindingAlgorithm::Basic,
        2 => LoopFindingAlgorithm::BasicTruncated,
        3 => LoopFindingAlgorithm::Filter,
        _ => LoopFindingAlgorithm::None,
    };
    let max_loop_length = read_u64(r)?;
    let timestamp_storage = match read_u8(r)? {
        1 => TimestampStorage::Delta,
        2 => TimestampStorage::Timestamp,
        _ => TimestampStorage::None,
    };
    let debug_level = match read_u8(r)? {
        1 => DebugLevel::Quiet,
        2 => DebugLevel::Normal,
        3 => DebugLevel::Verbose,
        4 => DebugLevel::Debug,
        5 => DebugLevel::Max,
        _ => DebugLevel::Error,
    };
    Ok(Parameters {
        compression_algorithm,
        encoding_algorithm,
        zstd_compression_level,
        loop_finding_algorithm,
        max_loop_length,
        timestamp_storage,
        debug_level,
    })
}

fn write_definitions(dir: &Path, defs: &Definitions) -> Result<()> {
    write_table(&dir.join("string.dat"), &defs.strings, |w, v| write_string(w, &v.bytes))?;
    write_table(&dir.join("regions.dat"), &defs.regions, |w, v| write_u32(w, v.string_ref))?;
    write_table(&dir.join("attributes.dat"), &defs.attributes, |w, v| {
        write_u32(w, v.name)?;
        write_u32(w, v.description)?;
        write_u8(w, v.attr_type as u8)
    })?;
    write_table(&dir.join("groups.dat"), &defs.groups, |w, v| {
        write_u32(w, v.name)?;
        write_usize(w, v.members.len())?;
        for m in &v.members {
            write_u32(w, *m)?;
        }
        Ok(())
    })?;
    write_table(&dir.join("comms.dat"), &defs.comms, |w, v| {
        write_u32(w, v.name)?;
        write_u32(w, v.group)?;
        write_opt_ref(w, v.parent)
    })?;
    write_table(&dir.join("locations.dat"), &defs.locations, |w, v| {
        write_u32(w, v.name)?;
        write_u32(w, v.parent_group)
    })?;
    write_table(&dir.join("location_groups.dat"), &defs.location_groups, |w, v| {
        write_u32(w, v.name)?;
        write_opt_ref(w, v.parent)?;
        write_opt_ref(w, v.main_location)
    })?;
    Ok(())
}

fn write_table<V>(
    path: &Path,
    table: &DefinitionTable<V>,
    mut write_value: impl FnMut(&mut Vec<u8>, &V) -> Result<()>,
) -> Result<()>
where
    V: PartialEq,
{
    let mut buf = Vec::new();
    write_usize(&mut buf, table.len())?;
    for (reference, value) in table.iter_ordered() {
        write_u32(&mut buf, reference)?;
        let mut record = Vec::new();
        write_value(&mut record, value)?;
        write_usize(&mut buf, record.len())?;
        buf.extend_from_slice(&record);
    }
    fs::write(path, buf)?;
    Ok(())
}

fn read_definitions(
    dir: &Path,
    mut insert: impl FnMut(DefKind, Ref, &[u8]) -> Result<()>,
) -> Result<()> {
    for (file, kind) in [
        ("string.dat", DefKind::String),
        ("regions.dat", DefKind::Region),
        ("attributes.dat", DefKind::Attribute),
        ("groups.dat", DefKind::Group),
        ("comms.dat", DefKind::Comm),
        ("locations.dat", DefKind::Location),
        ("location_groups.dat", DefKind::LocationGroup),
    ] {
        let path = dir.join(file);
        if !path.exists() {
            continue;
        }
        let bytes = fs::read(&path)?;
        let mut cursor = Cursor::new(bytes);
        let n = read_usize(&mut cursor)?;
        for _ in 0..n {
            let reference = read_u32(&mut cursor)?;
            let len = read_usize(&mut cursor)?;
            let record = read_bytes(&mut cursor, len)?;
            if let Err(PallasError::DuplicateDefinition(r)) = insert(kind, reference, &record) {
                log::warn!("ignoring duplicate definition for ref {r} in {file}");
            }
        }
    }
    Ok(())
}

fn write_thread(dir: &Path, thread: &Thread, archive_id: ArchiveId, params: &Parameters) -> Result<()> {
    fs::create_dir_all(dir)?;

    let mut header = Vec::new();
    write_u32(&mut header, thread.id.0)?;
    write_u32(&mut header, archive_id.0)?;
    write_u32(&mut header, thread.events.len() as u32)?;
    write_u32(&mut header, thread.sequences.len() as u32)?;
    write_u32(&mut header, thread.loops.len() as u32)?;
    fs::write(dir.join("thread.pallas"), header)?;

    let mut event_header = Vec::new();
    let mut event_durations = Vec::new();
    let mut offset = 0u64;
    for summary in &thread.events {
        write_event(&mut event_header, &mut event_durations, &mut offset, summary, params)?;
    }
    fs::write(dir.join("event.pallas"), event_header)?;
    fs::write(dir.join("event_durations.dat"), event_durations)?;

    let mut seq_header = Vec::new();
    let mut seq_durations = Vec::new();
    let mut offset = 0u64;
    for seq in &thread.sequences {
        write_sequence(&mut seq_header, &mut seq_durations, &mut offset, seq, params)?;
    }
    fs::write(dir.join("sequence.pallas"), seq_header)?;
    fs::write(dir.join("sequence_durations.dat"), seq_durations)?;

    let mut loop_buf = Vec::new();
    for lp in &thread.loops {
        write_u32(&mut loop_buf, lp.repeated_token.to_bits())?;
        write_usize(&mut loop_buf, lp.nb_iterations.len())?;
        for &n in &lp.nb_iterations {
            write_u32(&mut loop_buf, n)?;
        }
    }
    fs::write(dir.join("loop.pallas"), loop_buf)?;
    Ok(())
}

fn write_event<W: Write, V: Write>(
    header: &mut W,
    values: &mut V,
    offset: &mut u64,
    summary: &EventSummary,
    params: &Parameters,
) -> Result<()> {
    write_u16(header, summary.event.record)?;
    write_u8(header, summary.event.event_size)?;
    header.write_all(&summary.event.payload)?;
    let attrs = summary.attribute_buffer();
    write_usize(header, attrs.len())?;
    header.write_all(&attrs)?;
    summary.durations.write(header, values, offset, params)?;
    Ok(())
}

fn write_sequence<W: Write, V: Write>(
    header: &mut W,
    values: &mut V,
    offset: &mut u64,
    seq: &Sequence,
    params: &Parameters,
) -> Result<()> {
    write_usize(header, seq.tokens.len())?;
    for t in &seq.tokens {
        write_u32(header, t.to_bits())?;
    }
    seq.durations.write(header, values, offset, params)?;
    Ok(())
}

fn read_thread(dir: &Path, params: &Parameters) -> Result<Thread> {
    let header_bytes = fs::read(dir.join("thread.pallas"))?;
    let mut header = Cursor::new(header_bytes);
    let id = read_u32(&mut header)?;
    let _archive_id = read_u32(&mut header)?;
    let nb_events = read_u32(&mut header)? as usize;
    let nb_sequences = read_u32(&mut header)? as usize;
    let nb_loops = read_u32(&mut header)? as usize;

    let event_durations_path = dir.join("event_durations.dat");
    let event_bytes = fs::read(dir.join("event.pallas"))?;
    let mut event_cursor = Cursor::new(event_bytes);
    let mut events = Vec::with_capacity(nb_events);
    for i in 0..nb_events {
        let record = read_u16(&mut event_cursor)?;
        let event_size = read_u8(&mut event_cursor)?;
        let payload = read_bytes(&mut event_cursor, event_size as usize - 3)?;
        let mut summary = EventSummary::new(i as u32, Event { record, event_size, payload });
        let attr_len = read_usize(&mut event_cursor)?;
        let attr_bytes = read_bytes(&mut event_cursor, attr_len)?;
        summary.load_attribute_buffer(&attr_bytes)?;
        summary.durations = LinkedDurationVector::read_header(&mut event_cursor, event_durations_path.clone(), params)?;
        summary.nb_occurrences = summary.durations.size() as u64;
        events.push(summary);
    }

    let sequence_durations_path = dir.join("sequence_durations.dat");
    let sequence_bytes = fs::read(dir.join("sequence.pallas"))?;
    let mut sequence_cursor = Cursor::new(sequence_bytes);
    let mut sequences = Vec::with_capacity(nb_sequences);
    for i in 0..nb_sequences {
        let n = read_usize(&mut sequence_cursor)?;
        let mut tokens = Vec::with_capacity(n);
        for _ in 0..n {
            tokens.push(Token::from_bits(read_u32(&mut sequence_cursor)?));
        }
        let durations = LinkedDurationVector::read_header(&mut sequence_cursor, sequence_durations_path.clone(), params)?;
        let hash = hash_tokens(&tokens);
        let mut seq = Sequence::new(i as u32, hash, tokens);
        seq.durations = durations;
        sequences.push(seq);
    }

    let loop_bytes = fs::read(dir.join("loop.pallas"))?;
    let mut loop_cursor = Cursor::new(loop_bytes);
    let mut loops = Vec::with_capacity(nb_loops);
    for i in 0..nb_loops {
        let repeated_token = Token::from_bits(read_u32(&mut loop_cursor)?);
        let self_id = Token::new(crate::token::TokenKind::Loop, i as u32);
        let n = read_usize(&mut loop_cursor)?;
        let mut nb_iterations = Vec::with_capacity(n);
        for _ in 0..n {
            nb_iterations.push(read_u32(&mut loop_cursor)?);
        }
        loops.push(Loop { self_id, repeated_token, nb_iterations });
    }

    Ok(Thread { id: ThreadId(id), events, sequences, loops })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AttributeEntry, AttributeList, AttributeValue};
    use crate::params::{CompressionAlgorithm, EncodingAlgorithm, LoopFindingAlgorithm};
    use crate::thread_writer::{EventKind, ThreadWriter};

    fn build_trace(params: Parameters) -> Arc<GlobalArchive> {
        let global = GlobalArchive::new(42);
        global.add_string(1, "rank0".into()).unwrap();
        global.add_region(2, 1).unwrap();
        let archive = global.open_archive(ArchiveId(0));
        archive.add_string(3, "local".into()).unwrap();
        archive.add_attribute(4, 3, 3, AttributeType::Uint32).unwrap();
        archive.add_group(5, 3, vec![0, 1]).unwrap();
        archive.add_comm(6, 3, 5, None).unwrap();
        archive.define_location(7, 3, 5).unwrap();

        let mut writer = ThreadWriter::new(Thread::new(ThreadId(0)), params);
        for _ in 0..2 {
            writer.store_event(EventKind::Atomic, Event::new(1, vec![]), None, AttributeList::default());
            writer.store_event(EventKind::Atomic, Event::new(2, vec![]), None, AttributeList::default());
            writer.store_event(EventKind::Atomic, Event::new(3, vec![]), None, AttributeList::default());
        }
        let mut attrs = AttributeList::default();
        attrs.entries.push(AttributeEntry { attribute_ref: 2, value: AttributeValue::Uint32(7) });
        writer.store_event(EventKind::Atomic, Event::new(4, vec![9, 9]), None, attrs);
        let thread = writer.thread_close();
        archive.add_thread(thread);
        global
    }

    #[test]
    fn write_then_read_roundtrips_lossless_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let params = Parameters {
            compression_algorithm: CompressionAlgorithm::Zstd,
            encoding_algorithm: EncodingAlgorithm::Masking,
            loop_finding_algorithm: LoopFindingAlgorithm::BasicTruncated,
            ..Parameters::default()
        }
        .normalized();
        let global = build_trace(params.clone());

        Storage::write(dir.path(), "trace", &global, &params).unwrap();
        let (loaded, loaded_params) = Storage::read(dir.path(), "trace").unwrap();

        assert_eq!(loaded.group_id, 42);
        assert_eq!(loaded_params.compression_algorithm, CompressionAlgorithm::Zstd);
        assert_eq!(loaded.get_string(1).unwrap().bytes, "rank0");
        assert_eq!(loaded.get_region(2).unwrap().string_ref, 1);

        let archive = loaded.get_archive(ArchiveId(0)).unwrap();
        assert_eq!(archive.get_string(3).unwrap().bytes, "local");
        assert_eq!(archive.get_string(1).unwrap().bytes, "rank0"); // falls through
        assert_eq!(archive.get_attribute(4).unwrap().attr_type, AttributeType::Uint32);
        assert_eq!(archive.get_group(5).unwrap().members, vec![0, 1]);
        assert_eq!(archive.get_comm(6).unwrap().group, 5);
        assert_eq!(archive.get_location(7).unwrap().parent_group, 5);

        let thread = archive.take_thread(ThreadId(0)).unwrap();
        assert_eq!(thread.events.len(), 4);
        assert_eq!(thread.events[0].durations.size(), 2);
        assert_eq!(
            thread.events[3].attribute_list(0).unwrap().unwrap().entries[0].value,
            AttributeValue::Uint32(7)
        );

        // root sequence covers the whole trace, including the loop it factored out.
        assert_eq!(thread.sequences[0].durations.size(), 1);
        assert!(!thread.loops.is_empty());
    }

    #[test]
    fn write_then_read_roundtrips_uncompressed() {
        let dir = tempfile::tempdir().unwrap();
        let params = Parameters::default();
        let global = build_trace(params.clone());
        Storage::write(dir.path(), "trace", &global, &params).unwrap();
        let (loaded, _) = Storage::read(dir.path(), "trace").unwrap();
        let archive = loaded.get_archive(ArchiveId(0)).unwrap();
        let thread = archive.take_thread(ThreadId(0)).unwrap();
        assert_eq!(thread.events.len(), 4);
    }

    #[test]
    fn abi_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let params = Parameters::default();
        let global = build_trace(params.clone());
        Storage::write(dir.path(), "trace", &global, &params).unwrap();

        let header_path = dir.path().join("trace.pallas");
        let mut bytes = fs::read(&header_path).unwrap();
        bytes[4] = ABI_VERSION.wrapping_add(1);
        fs::write(&header_path, bytes).unwrap();

        let err = Storage::read(dir.path(), "trace");
        assert!(matches!(err, Err(PallasError::AbiMismatch { .. })));
    }
}
