// Copyright © 2023 David Caldwell <david@porkrind.org>

use std::fmt::Debug;

use anyhow::anyhow;
use bytebuffer::{ByteBuffer, Endian};

use crate::block::track::Density;
use crate::block::{Geometry, SECTOR_SIZE};
use crate::error::DiskError;
use super::fdr::{decode_name, encode_name, is_valid_name, NAME_LEN};

pub const BITMAP_OFFSET: usize = 0x38;
pub const BITMAP_BYTES: usize = SECTOR_SIZE - BITMAP_OFFSET;
pub const MAX_SUBDIRS: usize = 3;

#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Subdir {
    pub name: [u8; NAME_LEN],
    pub fdi: u16,
}

/// Volume Information Block (sector 0).
#[derive(Clone, PartialEq, Eq)]
pub struct Vib {
    pub name: [u8; NAME_LEN],
    pub formatted_sectors: u16,
    pub sectors_per_track: u8,
    pub protection: u8,
    pub tracks_per_side: u8,
    pub sides: u8,
    pub density: u8,
    pub subdirs: [Subdir; MAX_SUBDIRS],
    pub bitmap: [u8; BITMAP_BYTES],
}

impl Vib {
    /// A freshly initialised volume: only the VIB and the root FDI (sector 1) allocated.
    pub fn new(name: &str, geometry: &Geometry) -> anyhow::Result<Vib> {
        let total = geometry.total_sectors();
        if total > BITMAP_BYTES * 8 {
            return Err(DiskError::Unsupported("volumes with more than 1600 sectors").into());
        }
        let mut vib = Vib {
            name: encode_name(name)?,
            formatted_sectors: total as u16,
            sectors_per_track: geometry.sectors as u8,
            protection: b' ',
            tracks_per_side: geometry.tracks as u8,
            sides: geometry.sides as u8,
            density: match geometry.density { Density::Single => 1, _ => 2 },
            subdirs: Default::default(),
            bitmap: [0; BITMAP_BYTES],
        };
        vib.set_allocated(0, true);
        vib.set_allocated(1, true);
        // Bits past the end of the disk are marked used so nothing ever allocates them.
        for s in total..BITMAP_BYTES * 8 {
            vib.set_allocated(s, true);
        }
        Ok(vib)
    }

    pub fn from_repr(raw: &[u8]) -> anyhow::Result<Vib> {
        if raw.len() < SECTOR_SIZE {
            return Err(anyhow!("Short VIB ({} bytes)", raw.len()));
        }
        if &raw[0x0D..0x10] != b"DSK" {
            return Err(DiskError::NotFormatted.into());
        }
        let mut buf = ByteBuffer::from_bytes(raw);
        buf.set_endian(Endian::BigEndian);
        Ok(Vib {
            name: buf.read_bytes(NAME_LEN)?.try_into().map_err(|_| anyhow!("short name"))?,
            formatted_sectors: buf.read_u16()?,
            sectors_per_track: buf.read_u8()?,
            protection: { buf.read_bytes(3)?; buf.read_u8()? }, // skip "DSK"
            tracks_per_side: buf.read_u8()?,
            sides: buf.read_u8()?,
            density: buf.read_u8()?,
            subdirs: {
                let mut subdirs: [Subdir; MAX_SUBDIRS] = Default::default();
                for d in subdirs.iter_mut() {
                    d.name = buf.read_bytes(NAME_LEN)?.try_into().map_err(|_| anyhow!("short subdir name"))?;
                    d.fdi = buf.read_u16()?;
                }
                subdirs
            },
            bitmap: {
                debug_assert_eq!(BITMAP_OFFSET, buf.get_rpos());
                buf.read_bytes(BITMAP_BYTES)?.try_into().map_err(|_| anyhow!("short bitmap"))?
            },
        })
    }

    pub fn repr(&self) -> Vec<u8> {
        let mut buf = ByteBuffer::new();
        buf.set_endian(Endian::BigEndian);
        buf.write_bytes(&self.name);
        buf.write_u16(self.formatted_sectors);
        buf.write_u8(self.sectors_per_track);
        buf.write_bytes(b"DSK");
        buf.write_u8(self.protection);
        buf.write_u8(self.tracks_per_side);
        buf.write_u8(self.sides);
        buf.write_u8(self.density);
        for d in self.subdirs.iter() {
            buf.write_bytes(&d.name);
            buf.write_u16(d.fdi);
        }
        buf.write_bytes(&self.bitmap);
        buf.into_vec()
    }

    pub fn name(&self) -> String {
        decode_name(&self.name)
    }

    pub fn total_sectors(&self) -> usize {
        (self.formatted_sectors as usize).min(BITMAP_BYTES * 8)
    }

    pub fn is_protected(&self) -> bool {
        self.protection == b'P'
    }

    /// Subdirectories with a usable name and FDI pointer.
    pub fn subdirs(&self) -> impl Iterator<Item = (String, usize)> + '_ {
        let total = self.total_sectors();
        self.subdirs.iter()
            .filter(move |d| is_valid_name(&d.name) && d.fdi > 1 && (d.fdi as usize) < total)
            .map(|d| (decode_name(&d.name), d.fdi as usize))
    }

    // Sectors the bitmap can't describe count as allocated.
    pub fn is_allocated(&self, sector: usize) -> bool {
        self.bitmap.get(sector / 8).map(|b| b & 1 << (sector % 8) != 0).unwrap_or(true)
    }

    pub fn set_allocated(&mut self, sector: usize, allocated: bool) {
        if let Some(b) = self.bitmap.get_mut(sector / 8) {
            match allocated {
                true  => *b |= 1 << (sector % 8),
                false => *b &= !(1 << (sector % 8)),
            }
        }
    }
}

impl Debug for Vib {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            write!(f, "Volume:      {}\nSectors:     {}\nGeometry:    {} tracks, {} sides, {} sectors/track, density {}\nProtected:   {}\n",
                   self.name(), self.formatted_sectors, self.tracks_per_side, self.sides, self.sectors_per_track,
                   self.density, self.is_protected())?;
            for (name, fdi) in self.subdirs() {
                write!(f, "Directory:   {} (FDI @ {})\n", name, fdi)?;
            }
            write!(f, "Bitmap:")?;
            for s in 0..self.total_sectors() {
                if s % 64 == 0 { write!(f, "\n{:4}: ", s)? }
                write!(f, "{}", if self.is_allocated(s) { "X" } else { "_" })?;
            }
            Ok(())
        } else {
            f.debug_struct("Vib")
                .field("name",              &self.name())
                .field("formatted_sectors", &self.formatted_sectors)
                .field("sectors_per_track", &self.sectors_per_track)
                .field("tracks_per_side",   &self.tracks_per_side)
                .field("sides",             &self.sides)
                .field("density",           &self.density)
                .finish()
        }
    }
}
