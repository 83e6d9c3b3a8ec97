//! Binary persistence of correction tables.
//!
//! Little-endian throughout, unversioned; readers validate the stored
//! dimensions before allocating. Single-detector layout:
//!
//! ```text
//! [width u32][height u32][depth u32]
//! [offset u16 * W*H][gain f32 * W*H][baseline u16 * W*H]
//! ```
//!
//! Multi-detector layout:
//!
//! ```text
//! [count u32][depth u32]
//! per detector:
//!   [id u32][width u32][height u32][x_off i32][y_off i32]
//!   [active u8][normalization f32]
//!   [offset u16 * W*H][gain f32 * W*H][baseline u16 * W*H]
//! ```

use crate::error::{Error, Result};
use crate::flat_field::FlatField;
use crate::multi_detector::{DetectorArray, MAX_DETECTORS};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Upper bound on a stored dimension; rejects garbage headers before any
/// large allocation happens.
const MAX_DIMENSION: u32 = 65536;

/// Write a single-detector table set.
pub fn save_flat_field<P: AsRef<Path>>(path: P, tables: &FlatField) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    write_u32(&mut writer, tables.width() as u32)?;
    write_u32(&mut writer, tables.height() as u32)?;
    write_u32(&mut writer, tables.bit_depth() as u32)?;

    write_u16_table(&mut writer, tables.offset())?;
    write_f32_table(&mut writer, tables.gain())?;
    write_u16_table(&mut writer, tables.baseline())?;

    writer.flush()?;
    Ok(())
}

/// Read a single-detector table set, re-initialising to the stored
/// dimensions.
pub fn load_flat_field<P: AsRef<Path>>(path: P) -> Result<FlatField> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let width = read_u32(&mut reader)?;
    let height = read_u32(&mut reader)?;
    let depth = read_u32(&mut reader)?;
    check_dimension(width)?;
    check_dimension(height)?;
    if depth > u8::MAX as u32 {
        return Err(Error::Format("stored bit depth out of range"));
    }

    let mut tables = FlatField::new(width as usize, height as usize, depth as u8)?;
    let pixels = width as usize * height as usize;

    let offset = read_u16_table(&mut reader, pixels)?;
    let gain = read_f32_table(&mut reader, pixels)?;
    let baseline = read_u16_table(&mut reader, pixels)?;
    tables.set_offset(&offset)?;
    tables.set_gain(&gain)?;
    tables.set_baseline(&baseline)?;

    log::debug!(
        "loaded flat-field tables: {}x{} @ {} bit",
        width,
        height,
        depth
    );
    Ok(tables)
}

/// Write a multi-detector table set.
pub fn save_detector_array<P: AsRef<Path>>(path: P, array: &DetectorArray) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    write_u32(&mut writer, array.len() as u32)?;
    write_u32(&mut writer, array.bit_depth() as u32)?;

    for det in array.detectors() {
        write_u32(&mut writer, det.id)?;
        write_u32(&mut writer, det.width() as u32)?;
        write_u32(&mut writer, det.height() as u32)?;
        write_i32(&mut writer, det.x_offset())?;
        write_i32(&mut writer, det.y_offset())?;
        writer.write_all(&[det.is_active() as u8])?;
        writer.write_all(&det.normalization().to_le_bytes())?;

        write_u16_table(&mut writer, det.offset())?;
        write_f32_table(&mut writer, det.gain())?;
        write_u16_table(&mut writer, det.baseline())?;
    }

    writer.flush()?;
    Ok(())
}

/// Read a multi-detector table set, re-initialising to the stored layout.
pub fn load_detector_array<P: AsRef<Path>>(path: P) -> Result<DetectorArray> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let count = read_u32(&mut reader)?;
    let depth = read_u32(&mut reader)?;
    if count == 0 || count as usize > MAX_DETECTORS {
        return Err(Error::Format("stored detector count out of range"));
    }
    if depth > u8::MAX as u32 {
        return Err(Error::Format("stored bit depth out of range"));
    }

    struct Record {
        width: u32,
        height: u32,
        x_offset: i32,
        y_offset: i32,
        active: bool,
        normalization: f32,
        offset: Vec<u16>,
        gain: Vec<f32>,
        baseline: Vec<u16>,
    }

    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let _id = read_u32(&mut reader)?;
        let width = read_u32(&mut reader)?;
        let height = read_u32(&mut reader)?;
        check_dimension(width)?;
        check_dimension(height)?;
        let x_offset = read_i32(&mut reader)?;
        let y_offset = read_i32(&mut reader)?;

        let mut flag = [0u8; 1];
        reader.read_exact(&mut flag)?;
        let mut norm = [0u8; 4];
        reader.read_exact(&mut norm)?;
        let normalization = f32::from_le_bytes(norm);

        let pixels = width as usize * height as usize;
        records.push(Record {
            width,
            height,
            x_offset,
            y_offset,
            active: flag[0] != 0,
            normalization,
            offset: read_u16_table(&mut reader, pixels)?,
            gain: read_f32_table(&mut reader, pixels)?,
            baseline: read_u16_table(&mut reader, pixels)?,
        });
    }

    let dimensions: Vec<(usize, usize)> = records
        .iter()
        .map(|r| (r.width as usize, r.height as usize))
        .collect();
    let mut array = DetectorArray::new(&dimensions, depth as u8)?;

    for (i, record) in records.iter().enumerate() {
        array.set_position(i, record.x_offset, record.y_offset)?;
        array.set_active(i, record.active)?;
        if record.active {
            array.set_normalization(i, record.normalization)?;
        }
        array.set_offset(i, &record.offset)?;
        array.set_gain(i, &record.gain)?;
        array.set_baseline(i, &record.baseline)?;
    }

    log::debug!("loaded detector array: {} detectors @ {} bit", count, depth);
    Ok(array)
}

fn check_dimension(value: u32) -> Result<()> {
    if value == 0 || value > MAX_DIMENSION {
        return Err(Error::Format("stored dimension out of range"));
    }
    Ok(())
}

fn write_u32<W: Write>(writer: &mut W, value: u32) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_i32<W: Write>(writer: &mut W, value: i32) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_u16_table<W: Write>(writer: &mut W, table: &[u16]) -> Result<()> {
    for &v in table {
        writer.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn write_f32_table<W: Write>(writer: &mut W, table: &[f32]) -> Result<()> {
    for &v in table {
        writer.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32<R: Read>(reader: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_u16_table<R: Read>(reader: &mut R, count: usize) -> Result<Vec<u16>> {
    let mut bytes = vec![0u8; count * 2];
    reader.read_exact(&mut bytes)?;
    Ok(bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

fn read_f32_table<R: Read>(reader: &mut R, count: usize) -> Result<Vec<f32>> {
    let mut bytes = vec![0u8; count * 4];
    reader.read_exact(&mut bytes)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
