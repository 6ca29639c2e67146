// Copyright © 2023 David Caldwell <david@porkrind.org>

// Raw encoding
pub mod track;

// Image file formats
pub mod pc99;
pub mod v9t9;
pub mod anadisk;
pub mod cf7;

// Logical view (what the filesystem sees)
pub mod logical;

use std::cell::RefCell;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{anyhow, Context};
use log::{debug, info, warn};
use serde::Deserialize;

use crate::error::DiskError;
use track::{Density, NewSector, Sector, SectorId, Track, DATA_MARK};

pub const SECTOR_SIZE: usize = 256;
pub const MAX_TRACKS: usize = 80;
pub const MAX_SIDES: usize = 2;

pub trait SectorDevice {
    fn read_sector(&self, sector: usize) -> anyhow::Result<Vec<u8>>;
    fn write_sector(&mut self, sector: usize, buf: &[u8]) -> anyhow::Result<()>;
    fn sectors(&self) -> usize;

    // Push pending changes out to wherever the device lives.
    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, strum::EnumVariantNames)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ImageFormat {
    Unknown,
    Pc99,
    V9t9,
    AnaDisk,
    Cf7,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub tracks: usize,
    pub sides: usize,
    pub sectors: usize,
    pub density: Density,
}

pub const SSSD_GEOMETRY: Geometry = Geometry { tracks: 40, sides: 1, sectors:  9, density: Density::Single };
pub const DSSD_GEOMETRY: Geometry = Geometry { tracks: 40, sides: 2, sectors:  9, density: Density::Single };
pub const SSDD_GEOMETRY: Geometry = Geometry { tracks: 40, sides: 1, sectors: 18, density: Density::Double };
pub const DSDD_GEOMETRY: Geometry = Geometry { tracks: 40, sides: 2, sectors: 18, density: Density::Double };
pub const DSQD_GEOMETRY: Geometry = Geometry { tracks: 80, sides: 2, sectors: 18, density: Density::Double };

impl Geometry {
    pub fn total_sectors(&self) -> usize {
        self.tracks * self.sides * self.sectors
    }

    // The TI disk controller numbers sectors up side 0 and then back down side 1, so logical sector
    // `tracks * sectors` is on the last track of side 1.
    pub fn physical_from_logical(&self, sector: usize) -> Option<(usize/*Track*/, usize/*Side*/, usize/*Sector*/)> {
        if sector >= self.total_sectors() || self.sectors == 0 {
            return None;
        }
        let t = sector / self.sectors;
        let s = sector % self.sectors;
        match t < self.tracks {
            true  => Some((t, 0, s)),
            false => Some((2 * self.tracks - 1 - t, 1, s)),
        }
    }

    pub fn logical_from_physical(&self, track: usize, side: usize, sector: usize) -> usize {
        let t = match side {
            0 => track,
            _ => 2 * self.tracks - 1 - track,
        };
        t * self.sectors + sector
    }

    // Best guess for a raw sector dump that has no usable VIB.
    pub fn from_sector_count(count: usize) -> Option<Geometry> {
        [SSSD_GEOMETRY, DSSD_GEOMETRY, DSDD_GEOMETRY, DSQD_GEOMETRY,
         Geometry { tracks: 35, sides: 1, sectors: 9, density: Density::Single },
         Geometry { tracks: 35, sides: 2, sectors: 9, density: Density::Single },
         Geometry { tracks: 40, sides: 2, sectors: 16, density: Density::Double },
         Geometry { tracks: 80, sides: 2, sectors: 36, density: Density::Double }]
            .into_iter()
            .find(|g| g.total_sectors() == count)
    }

    // Reads geometry out of a VIB (sector 0). Only trusted if it's self consistent.
    pub fn from_vib(vib: &[u8]) -> Option<Geometry> {
        if vib.len() < 0x14 || &vib[0x0D..0x10] != b"DSK" {
            return None;
        }
        let (sectors, tracks, sides) = (vib[0x0C] as usize, vib[0x11] as usize, vib[0x12] as usize);
        if !(1..=track::MAX_SECTORS).contains(&sectors) || !(1..=MAX_TRACKS).contains(&tracks) || !(1..=MAX_SIDES).contains(&sides) {
            return None;
        }
        Some(Geometry {
            tracks,
            sides,
            sectors,
            density: if vib[0x13] >= 2 || sectors > 9 { Density::Double } else { Density::Single },
        })
    }

    // Track 0 with `sectors` standard 256 byte sectors, sector data from `data(logical_sector)`.
    pub fn format_track(&self, track: usize, side: usize, data: impl Fn(usize) -> Vec<u8>) -> Track {
        let order = track::interleave(self.sectors, self.density.layout().interleave);
        Track::format(self.density, &order.into_iter().map(|s| NewSector {
            id: SectorId { cylinder: track as u8, side: side as u8, sector: s, size: 1 },
            data_mark: DATA_MARK,
            data: data(self.logical_from_physical(track, side, s as usize)),
        }).collect::<Vec<_>>())
    }
}

pub type SharedMedia = Rc<RefCell<DiskMedia>>;

/// An in-memory disk: every track of every side, fully encoded.
pub struct DiskMedia {
    path: Option<PathBuf>,
    volume: Option<usize>,
    format: ImageFormat,
    sides: [Vec<Track>; MAX_SIDES],
    write_protected: bool,
    changed: bool,
}

/// Splits the CF7 volume suffix off a path: `disk.img#2` → (`disk.img`, Some(2)).
pub fn split_volume(path: &Path) -> (PathBuf, Option<usize>) {
    let s = path.to_string_lossy();
    if let Some((name, vol)) = s.rsplit_once('#') {
        if let Ok(v) = vol.parse::<usize>() {
            if v >= 1 {
                return (PathBuf::from(name), Some(v));
            }
        }
    }
    (path.to_owned(), None)
}

pub fn determine_format(image: &[u8]) -> ImageFormat {
    let at = |offset: usize, pattern: &[u8]| image.get(offset..offset + pattern.len()) == Some(pattern);
    if at(0x0D, b"DSK") {
        return ImageFormat::V9t9;
    }
    if at(0x15, b"DSK") {
        return ImageFormat::AnaDisk;
    }
    if at(0x1A, b"D") && at(0x1C, b"S") && at(0x1E, b"K") {
        return ImageFormat::Cf7;
    }
    let probe = &image[..image.len().min(64)];
    if track::find_address_mark(probe, 0, Density::Single.min_sync(), track::MarkKind::Id).is_some() {
        return ImageFormat::Pc99;
    }
    ImageFormat::Unknown
}

impl DiskMedia {
    /// Unformatted media: every track blank.
    pub fn blank(geometry: Geometry) -> DiskMedia {
        DiskMedia {
            path: None,
            volume: None,
            format: ImageFormat::Unknown,
            sides: std::array::from_fn(|side| match side < geometry.sides {
                true  => (0..geometry.tracks).map(|_| Track::blank(geometry.density)).collect(),
                false => vec![],
            }),
            write_protected: false,
            changed: false,
        }
    }

    /// Low level formatted media (every sector present and filled with 0xE5), but no filesystem.
    pub fn formatted(geometry: Geometry) -> DiskMedia {
        let mut media = DiskMedia::blank(geometry);
        for side in 0..geometry.sides {
            for t in 0..geometry.tracks {
                media.sides[side][t] = geometry.format_track(t, side, |_| vec![0xE5; SECTOR_SIZE]);
            }
        }
        media
    }

    pub fn from_tracks(format: ImageFormat, sides: [Vec<Track>; MAX_SIDES]) -> DiskMedia {
        DiskMedia { path: None, volume: None, format, sides, write_protected: false, changed: false }
    }

    /// Decodes an image. Never fails: a bad image becomes blank media of unknown format.
    pub fn from_bytes(image: &[u8], volume: Option<usize>) -> DiskMedia {
        let format = match volume.map(|v| cf7::volume(image, v)) {
            Some(Ok(vol)) if determine_format(&vol) == ImageFormat::V9t9 => ImageFormat::Cf7,
            _ => determine_format(image),
        };
        let decoded = match format {
            ImageFormat::Pc99    => pc99::from_bytes(image),
            ImageFormat::V9t9    => v9t9::from_bytes(image),
            ImageFormat::AnaDisk => anadisk::from_bytes(image),
            ImageFormat::Cf7     => cf7::from_bytes(image, volume.unwrap_or(1)),
            ImageFormat::Unknown => Err(anyhow!("Unknown image format")),
        };
        match decoded {
            Ok(sides) => {
                let mut media = DiskMedia::from_tracks(format, sides);
                media.volume = volume;
                debug!("Loaded {:?} image: {} tracks, {} sides", format, media.num_tracks(), media.num_sides());
                media
            },
            Err(e) => {
                warn!("Couldn't decode disk image: {:#}", e);
                let mut media = DiskMedia::blank(SSSD_GEOMETRY);
                media.volume = volume;
                media
            },
        }
    }

    pub fn open(path: &Path) -> DiskMedia {
        let (file, volume) = split_volume(path);
        let mut media = match std::fs::read(&file) {
            Ok(image) => DiskMedia::from_bytes(&image, volume),
            Err(e) => {
                warn!("Couldn't read {}: {}", file.to_string_lossy(), e);
                DiskMedia::blank(SSSD_GEOMETRY)
            },
        };
        media.write_protected = std::fs::metadata(&file).map(|m| m.permissions().readonly()).unwrap_or(false);
        media.path = Some(file);
        media.volume = volume;
        info!("Opened {} ({:?}{})", path.to_string_lossy(), media.format, if media.write_protected { ", write protected" } else { "" });
        media
    }

    pub fn shared(self) -> SharedMedia {
        Rc::new(RefCell::new(self))
    }

    pub fn format(&self) -> ImageFormat           { self.format }
    pub fn path(&self) -> Option<&Path>            { self.path.as_deref() }
    pub fn volume(&self) -> Option<usize>          { self.volume }
    pub fn has_changed(&self) -> bool              { self.changed }
    pub fn is_write_protected(&self) -> bool       { self.write_protected }
    pub fn set_write_protected(&mut self, p: bool) { self.write_protected = p }
    pub fn set_volume(&mut self, v: Option<usize>) { self.volume = v }

    pub fn num_tracks(&self) -> usize {
        self.sides.iter().map(|s| s.len()).max().unwrap_or(0)
    }

    pub fn num_sides(&self) -> usize {
        self.sides.iter().filter(|s| !s.is_empty()).count()
    }

    pub fn geometry(&self) -> Geometry {
        let first = self.track(0, 0);
        Geometry {
            tracks: self.num_tracks(),
            sides: self.num_sides(),
            sectors: first.map(|t| t.sectors.len()).unwrap_or(0),
            density: first.map(|t| t.density).unwrap_or_default(),
        }
    }

    pub fn track(&self, track: usize, side: usize) -> Option<&Track> {
        self.sides.get(side)?.get(track)
    }

    pub fn tracks(&self, side: usize) -> &[Track] {
        self.sides.get(side).map(|s| &s[..]).unwrap_or(&[])
    }

    pub fn find_sector(&self, track: usize, side: usize, sector: u8, cylinder: u8) -> Option<Sector> {
        self.track(track, side)?.find(sector, cylinder).copied()
    }

    pub fn read_sector(&self, track: usize, side: usize, sector: u8, cylinder: u8) -> Option<&[u8]> {
        let t = self.track(track, side)?;
        Some(t.sector_data(t.find(sector, cylinder)?))
    }

    /// Returns false if the sector doesn't exist or the media is write protected.
    pub fn write_sector(&mut self, track: usize, side: usize, sector: u8, cylinder: u8, buf: &[u8], data_mark: Option<u8>) -> bool {
        if self.write_protected {
            return false;
        }
        let Some(t) = self.sides.get_mut(side).and_then(|s| s.get_mut(track)) else { return false };
        let Some(index) = t.sectors.iter().position(|s| s.id.sector == sector && s.id.cylinder == cylinder) else { return false };
        if t.write_sector(index, buf, data_mark) {
            self.changed = true;
        }
        true
    }

    /// Replaces a whole track with raw bytes (as written by a format operation) and re-indexes it.
    pub fn write_track(&mut self, track: usize, side: usize, raw: &[u8]) -> bool {
        if self.write_protected || track >= MAX_TRACKS || side >= MAX_SIDES {
            return false;
        }
        let density = raw.first().map(|b| Density::from_gap_byte(*b)).unwrap_or_default();
        let tracks = &mut self.sides[side];
        while tracks.len() <= track {
            tracks.push(Track::blank(density));
        }
        let t = &mut tracks[track];
        let raw = &raw[..raw.len().min(track::MAX_TRACK_SIZE)];
        if t.data != raw {
            t.data.clear();
            t.data.extend_from_slice(raw);
            t.rebuild();
            self.changed = true;
        }
        true
    }

    pub fn format_track(&mut self, track: usize, side: usize, density: Density, sectors: &[NewSector]) -> bool {
        self.write_track(track, side, &Track::format(density, sectors).data)
    }

    pub fn read_logical_sector(&self, geometry: &Geometry, sector: usize) -> Option<&[u8]> {
        let (t, h, s) = geometry.physical_from_logical(sector)?;
        self.read_sector(t, h, s as u8, t as u8)
    }

    pub fn write_logical_sector(&mut self, geometry: &Geometry, sector: usize, buf: &[u8]) -> bool {
        let Some((t, h, s)) = geometry.physical_from_logical(sector) else { return false };
        self.write_sector(t, h, s as u8, t as u8, buf, None)
    }

    /// Raw sector images can't carry sector sizes other than 256, non-standard data marks or missing
    /// sectors.
    pub fn is_valid_raw_sector(&self) -> bool {
        let g = self.geometry();
        g.sectors > 0
            && (0..g.total_sectors()).all(|n| self.read_logical_sector(&g, n).is_some())
            && self.sides.iter().flatten().flat_map(|t| t.sectors.iter())
                .all(|s| s.len() == SECTOR_SIZE && s.data_mark == DATA_MARK)
    }

    /// Geometry to use when flattening to logical sectors: the VIB's if this media can satisfy it.
    pub fn logical_geometry(&self) -> Geometry {
        let g = self.geometry();
        match self.read_logical_sector(&g, 0).and_then(Geometry::from_vib) {
            Some(vib) if vib.tracks <= g.tracks && vib.sides <= g.sides
                      && (0..vib.total_sectors()).all(|n| self.read_logical_sector(&vib, n).is_some()) => vib,
            _ => g,
        }
    }

    pub fn to_bytes(&self, format: ImageFormat) -> anyhow::Result<Vec<u8>> {
        match format {
            ImageFormat::Pc99    => pc99::repr(self),
            ImageFormat::V9t9    => v9t9::repr(self),
            ImageFormat::AnaDisk => anadisk::repr(self),
            ImageFormat::Cf7     => cf7::repr(self, vec![], 1),
            ImageFormat::Unknown => Err(DiskError::CannotRepresent(format, "no format chosen"))?,
        }
    }

    // Media that came from nowhere gets the simplest format that can hold it.
    fn preferred_format(&self) -> ImageFormat {
        match self.format {
            ImageFormat::Unknown if self.is_valid_raw_sector() => ImageFormat::V9t9,
            ImageFormat::Unknown => ImageFormat::Pc99,
            f => f,
        }
    }

    /// Writes the image back where it came from. Does nothing if there are no changes.
    pub fn save(&mut self) -> anyhow::Result<()> {
        if !self.changed {
            return Ok(());
        }
        let Some(path) = self.path.clone() else {
            return Err(anyhow!("Media has no file to save to"));
        };
        self.save_as(&path, self.preferred_format())
    }

    pub fn save_as(&mut self, path: &Path, format: ImageFormat) -> anyhow::Result<()> {
        let image = match (self.format, format) {
            (_, ImageFormat::Cf7) => {
                // The container holds other volumes: patch ours in place.
                let container = match std::fs::read(path) {
                    Ok(c) => c,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => vec![],
                    Err(e) => Err(e).with_context(|| format!("{}", path.to_string_lossy()))?,
                };
                cf7::repr(self, container, self.volume.unwrap_or(1))?
            },
            (ImageFormat::Cf7, _) =>
                Err(DiskError::CannotRepresent(format, "CF7 volumes can only be saved back into a CF7 container"))?,
            (_, f) => self.to_bytes(f)?,
        };
        let newname = path.with_file_name(format!("{}.new", path.file_name().map(|f| f.to_string_lossy()).unwrap_or_default()));
        std::fs::write(&newname, &image).with_context(|| format!("{}", newname.to_string_lossy()))?;
        std::fs::rename(&newname, path).with_context(|| format!("{}", path.to_string_lossy()))?;
        info!("Saved {} as {:?}", path.to_string_lossy(), format);
        self.path = Some(path.to_owned());
        self.format = format;
        self.changed = false;
        Ok(())
    }
}

impl Drop for DiskMedia {
    fn drop(&mut self) {
        if self.changed && self.path.is_some() {
            if let Err(e) = self.save() {
                warn!("Lost changes to {}: {:#}", self.path.as_ref().map(|p| p.to_string_lossy()).unwrap_or_default(), e);
            }
        }
    }
}

impl Debug for DiskMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            write!(f, "Disk {:?} {:?}, {} tracks, {} sides{}{}\n",
                   self.path, self.format, self.num_tracks(), self.num_sides(),
                   if self.write_protected { ", write protected" } else { "" },
                   if self.changed { ", modified" } else { "" })?;
            for (side, tracks) in self.sides.iter().enumerate() {
                for (t, track) in tracks.iter().enumerate() {
                    write!(f, "Side {} Track {}: {:?}, {} sectors\n", side, t, track.density, track.sectors.len())?;
                }
            }
            Ok(())
        } else {
            f.debug_struct("DiskMedia")
                .field("path",   &self.path)
                .field("format", &self.format)
                .field("tracks", &self.num_tracks())
                .field("sides",  &self.num_sides())
                .field("changed", &self.changed)
                .finish()
        }
    }
}
