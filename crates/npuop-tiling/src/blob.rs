//! Tiling-data blob: an explicit field schema and a little-endian packer.
//!
//! Every blob starts with a `schema_version` field followed by the common
//! plan header; operator families append their own fields. Host and device
//! code both go through [`BlobWriter`] / [`BlobReader`] against the same
//! [`BlobSchema`], so field order and widths cannot drift between them.

use std::fmt;

use npuop_common::{Result, TilingError};

use crate::planner::{CoreSplit, GridSplit, PlanGeometry, SizeRegime, TilingPlan};

/// Width of one blob field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldWidth {
    U32,
    U64,
    I64,
    F32,
}

impl FieldWidth {
    pub const fn bytes(self) -> usize {
        match self {
            Self::U32 | Self::F32 => 4,
            Self::U64 | Self::I64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub name: &'static str,
    pub width: FieldWidth,
}

pub const fn u32f(name: &'static str) -> FieldDef {
    FieldDef { name, width: FieldWidth::U32 }
}

pub const fn u64f(name: &'static str) -> FieldDef {
    FieldDef { name, width: FieldWidth::U64 }
}

pub const fn i64f(name: &'static str) -> FieldDef {
    FieldDef { name, width: FieldWidth::I64 }
}

pub const fn f32f(name: &'static str) -> FieldDef {
    FieldDef { name, width: FieldWidth::F32 }
}

/// Ordered field list of one blob layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobSchema {
    pub name: &'static str,
    pub version: u32,
    pub fields: &'static [FieldDef],
}

impl BlobSchema {
    pub const fn byte_len(&self) -> usize {
        let mut total = 0;
        let mut i = 0;
        while i < self.fields.len() {
            total += self.fields[i].width.bytes();
            i += 1;
        }
        total
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// Fields shared by every family, in wire order.
pub const PLAN_HEADER_FIELDS: [FieldDef; 19] = [
    u32f("schema_version"),
    u64f("tiling_key"),
    u32f("used_core_num"),
    u64f("rows"),
    u64f("row_elems"),
    u64f("row_inner"),
    u64f("col_inner"),
    u64f("pass_elems"),
    u64f("normal_blocks"),
    u32f("big_cores"),
    u64f("small_blocks"),
    u32f("elem_bytes"),
    u32f("align_bytes"),
    u32f("buffer_num"),
    u32f("tail_merge"),
    u32f("scratch_stride"),
    u32f("regime"),
    u64f("main_chunk_elems"),
    u64f("tail_chunk_elems"),
];

/// Build a family schema at compile time: header fields then `ext`.
pub const fn concat_fields<const N: usize>(ext: &[FieldDef]) -> [FieldDef; N] {
    assert!(N == PLAN_HEADER_FIELDS.len() + ext.len(), "schema length mismatch");
    let mut out = [u32f(""); N];
    let mut i = 0;
    while i < PLAN_HEADER_FIELDS.len() {
        out[i] = PLAN_HEADER_FIELDS[i];
        i += 1;
    }
    let mut j = 0;
    while j < ext.len() {
        out[i + j] = ext[j];
        j += 1;
    }
    out
}

pub const PLAN_HEADER_LEN: usize = 4 + 8 + 4 + 8 * 6 + 4 + 8 + 4 * 6 + 8 * 2;

const _: () = assert!(
    BlobSchema { name: "header", version: 1, fields: &PLAN_HEADER_FIELDS }.byte_len() == PLAN_HEADER_LEN
);

// ---------------------------------------------------------------------------
// Blob
// ---------------------------------------------------------------------------

/// Serialized tiling data, tagged with the schema it was written against.
#[derive(Clone, PartialEq, Eq)]
pub struct TilingBlob {
    schema: &'static BlobSchema,
    bytes: Vec<u8>,
}

impl TilingBlob {
    pub fn schema(&self) -> &'static BlobSchema {
        self.schema
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn reader(&self) -> Result<BlobReader<'_>> {
        BlobReader::new(self.schema, &self.bytes)
    }

    /// Lowercase hex, for logs and snapshots.
    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for TilingBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TilingBlob")
            .field("schema", &self.schema.name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Writer / reader
// ---------------------------------------------------------------------------

/// Sequential writer that checks each field against the schema.
#[derive(Debug)]
pub struct BlobWriter {
    schema: &'static BlobSchema,
    bytes: Vec<u8>,
    next: usize,
}

impl BlobWriter {
    /// Start a blob; writes the leading `schema_version` field.
    pub fn new(schema: &'static BlobSchema) -> Result<Self> {
        let mut writer = Self { schema, bytes: Vec::with_capacity(schema.byte_len()), next: 0 };
        writer.put_u32("schema_version", schema.version)?;
        Ok(writer)
    }

    fn expect(&mut self, name: &str, width: FieldWidth) -> Result<()> {
        let field = self.schema.fields.get(self.next).ok_or_else(|| {
            TilingError::Schema(format!("{}: extra field `{name}` after the last field", self.schema.name))
        })?;
        if field.name != name || field.width != width {
            return Err(TilingError::Schema(format!(
                "{}: expected field `{}` ({:?}) at position {}, got `{name}` ({width:?})",
                self.schema.name, field.name, field.width, self.next
            )));
        }
        self.next += 1;
        Ok(())
    }

    pub fn put_u32(&mut self, name: &str, value: u32) -> Result<()> {
        self.expect(name, FieldWidth::U32)?;
        self.bytes.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Narrowing write for values computed in `u64`.
    pub fn put_u32_from(&mut self, name: &str, value: u64) -> Result<()> {
        let narrowed = u32::try_from(value).map_err(|_| {
            TilingError::Schema(format!("{}: field `{name}` value {value} exceeds u32", self.schema.name))
        })?;
        self.put_u32(name, narrowed)
    }

    pub fn put_u64(&mut self, name: &str, value: u64) -> Result<()> {
        self.expect(name, FieldWidth::U64)?;
        self.bytes.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn put_i64(&mut self, name: &str, value: i64) -> Result<()> {
        self.expect(name, FieldWidth::I64)?;
        self.bytes.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn put_f32(&mut self, name: &str, value: f32) -> Result<()> {
        self.expect(name, FieldWidth::F32)?;
        self.bytes.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn finish(self) -> Result<TilingBlob> {
        if self.next != self.schema.fields.len() {
            let missing = self.schema.fields[self.next].name;
            return Err(TilingError::Schema(format!(
                "{}: blob finished before field `{missing}`",
                self.schema.name
            )));
        }
        Ok(TilingBlob { schema: self.schema, bytes: self.bytes })
    }
}

/// Sequential reader mirroring [`BlobWriter`].
#[derive(Debug)]
pub struct BlobReader<'a> {
    schema: &'static BlobSchema,
    bytes: &'a [u8],
    next: usize,
    pos: usize,
}

impl<'a> BlobReader<'a> {
    /// Validate length and schema version, leaving the cursor after the
    /// version field.
    pub fn new(schema: &'static BlobSchema, bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() != schema.byte_len() {
            return Err(TilingError::Schema(format!(
                "{}: blob is {} bytes, schema v{} needs {}",
                schema.name,
                bytes.len(),
                schema.version,
                schema.byte_len()
            )));
        }
        let mut reader = Self { schema, bytes, next: 0, pos: 0 };
        let version = reader.u32("schema_version")?;
        if version != schema.version {
            return Err(TilingError::Schema(format!(
                "{}: blob has schema version {version}, expected {}",
                schema.name, schema.version
            )));
        }
        Ok(reader)
    }

    fn take<const N: usize>(&mut self, name: &str, width: FieldWidth) -> Result<[u8; N]> {
        let field = self.schema.fields.get(self.next).ok_or_else(|| {
            TilingError::Schema(format!("{}: read of `{name}` past the last field", self.schema.name))
        })?;
        if field.name != name || field.width != width {
            return Err(TilingError::Schema(format!(
                "{}: expected field `{}` at position {}, asked for `{name}`",
                self.schema.name, field.name, self.next
            )));
        }
        let mut out = [0u8; N];
        let end = self.pos + N;
        let src = self.bytes.get(self.pos..end).ok_or_else(|| {
            TilingError::Schema(format!("{}: blob truncated at `{name}`", self.schema.name))
        })?;
        out.copy_from_slice(src);
        self.pos = end;
        self.next += 1;
        Ok(out)
    }

    pub fn u32(&mut self, name: &str) -> Result<u32> {
        self.take::<4>(name, FieldWidth::U32).map(u32::from_le_bytes)
    }

    pub fn u64(&mut self, name: &str) -> Result<u64> {
        self.take::<8>(name, FieldWidth::U64).map(u64::from_le_bytes)
    }

    pub fn i64(&mut self, name: &str) -> Result<i64> {
        self.take::<8>(name, FieldWidth::I64).map(i64::from_le_bytes)
    }

    pub fn f32(&mut self, name: &str) -> Result<f32> {
        self.take::<4>(name, FieldWidth::F32).map(f32::from_le_bytes)
    }

    pub fn is_done(&self) -> bool {
        self.next == self.schema.fields.len()
    }
}

// ---------------------------------------------------------------------------
// Plan header
// ---------------------------------------------------------------------------

fn regime_code(regime: SizeRegime) -> u32 {
    match regime {
        SizeRegime::Small => 0,
        SizeRegime::Aligned => 1,
        SizeRegime::AlignedLastAxisBig => 2,
        SizeRegime::Unaligned => 3,
    }
}

fn regime_from_code(code: u32) -> Result<SizeRegime> {
    match code {
        0 => Ok(SizeRegime::Small),
        1 => Ok(SizeRegime::Aligned),
        2 => Ok(SizeRegime::AlignedLastAxisBig),
        3 => Ok(SizeRegime::Unaligned),
        other => Err(TilingError::Schema(format!("unknown regime code {other}"))),
    }
}

/// Write the common header of `plan` (after the version field).
pub fn write_plan_header(w: &mut BlobWriter, plan: &TilingPlan) -> Result<()> {
    let g = &plan.geometry;
    w.put_u64("tiling_key", plan.tiling_key.to_wire()?)?;
    w.put_u32_from("used_core_num", g.cores.used_core_num)?;
    w.put_u64("rows", g.grid.rows)?;
    w.put_u64("row_elems", g.grid.row_elems)?;
    w.put_u64("row_inner", g.grid.row_inner)?;
    w.put_u64("col_inner", g.grid.col_inner)?;
    w.put_u64("pass_elems", g.pass_elems)?;
    w.put_u64("normal_blocks", g.cores.normal_blocks)?;
    w.put_u32_from("big_cores", g.cores.big_cores)?;
    w.put_u64("small_blocks", g.cores.small_blocks)?;
    w.put_u32_from("elem_bytes", g.elem_bytes)?;
    w.put_u32_from("align_bytes", g.align_bytes)?;
    w.put_u32_from("buffer_num", g.buffer_num)?;
    w.put_u32("tail_merge", u32::from(g.tail_merge))?;
    w.put_u32_from("scratch_stride", g.scratch_stride_bytes)?;
    w.put_u32("regime", regime_code(g.regime))?;
    w.put_u64("main_chunk_elems", plan.main_chunk_elems())?;
    w.put_u64("tail_chunk_elems", plan.tail_chunk_elems())?;
    Ok(())
}

/// Device-side view of the common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanHeader {
    pub wire_key: u64,
    pub geometry: PlanGeometry,
    pub main_chunk_elems: u64,
    pub tail_chunk_elems: u64,
}

impl PlanHeader {
    pub fn read(r: &mut BlobReader<'_>) -> Result<Self> {
        let wire_key = r.u64("tiling_key")?;
        let used_core_num = u64::from(r.u32("used_core_num")?);
        let rows = r.u64("rows")?;
        let row_elems = r.u64("row_elems")?;
        let row_inner = r.u64("row_inner")?;
        let col_inner = r.u64("col_inner")?;
        let pass_elems = r.u64("pass_elems")?;
        let normal_blocks = r.u64("normal_blocks")?;
        let big_cores = u64::from(r.u32("big_cores")?);
        let small_blocks = r.u64("small_blocks")?;
        let elem_bytes = u64::from(r.u32("elem_bytes")?);
        let align_bytes = u64::from(r.u32("align_bytes")?);
        let buffer_num = u64::from(r.u32("buffer_num")?);
        let tail_merge = r.u32("tail_merge")? != 0;
        let scratch_stride_bytes = u64::from(r.u32("scratch_stride")?);
        let regime = regime_from_code(r.u32("regime")?)?;
        let main_chunk_elems = r.u64("main_chunk_elems")?;
        let tail_chunk_elems = r.u64("tail_chunk_elems")?;

        let grid = GridSplit::new(rows, row_elems, row_inner, col_inner)?;
        let cores = CoreSplit { used_core_num, normal_blocks, big_cores, small_blocks };
        if cores.total_blocks() != grid.block_count() {
            return Err(TilingError::Schema(format!(
                "core split covers {} blocks but the grid has {}",
                cores.total_blocks(),
                grid.block_count()
            )));
        }
        let geometry = PlanGeometry {
            grid,
            cores,
            pass_elems,
            elem_bytes,
            align_bytes,
            tail_merge,
            scratch_stride_bytes,
            buffer_num,
            regime,
        };
        Ok(Self { wire_key, geometry, main_chunk_elems, tail_chunk_elems })
    }
}
