// Copyright © 2023 David Caldwell <david@porkrind.org>

use anyhow::anyhow;
use log::debug;

use super::track::Track;
use super::{DiskMedia, Geometry, ImageFormat, MAX_SIDES, SECTOR_SIZE};
use crate::error::DiskError;

/// Geometry of a raw sector dump: what the VIB claims if the file agrees, else a guess from the size.
pub fn geometry(image: &[u8]) -> anyhow::Result<Geometry> {
    let sectors = image.len() / SECTOR_SIZE;
    match image.get(..SECTOR_SIZE).and_then(Geometry::from_vib) {
        Some(g) if g.total_sectors() == sectors => Ok(g),
        vib => Geometry::from_sector_count(sectors)
            // Padded images: trust the VIB if all of its sectors are present.
            .or(vib.filter(|g| g.total_sectors() <= sectors))
            .ok_or(anyhow!("Can't determine geometry of a {} byte image", image.len())),
    }
}

pub fn tracks_from_sectors(image: &[u8], g: &Geometry) -> [Vec<Track>; MAX_SIDES] {
    std::array::from_fn(|side| match side < g.sides {
        true => (0..g.tracks).map(|t| g.format_track(t, side, |n| image[n * SECTOR_SIZE..(n + 1) * SECTOR_SIZE].to_vec())).collect(),
        false => vec![],
    })
}

pub fn from_bytes(image: &[u8]) -> anyhow::Result<[Vec<Track>; MAX_SIDES]> {
    if image.len() % SECTOR_SIZE != 0 {
        return Err(anyhow!("Image size {} isn't a multiple of {}", image.len(), SECTOR_SIZE));
    }
    let g = geometry(image)?;
    debug!("v9t9: {:?}", g);
    Ok(tracks_from_sectors(image, &g))
}

/// Flattens media into logical sector order.
pub fn sectors(media: &DiskMedia, g: &Geometry, format: ImageFormat) -> anyhow::Result<Vec<u8>> {
    if !media.is_valid_raw_sector() {
        return Err(DiskError::CannotRepresent(format, "media has non-standard sectors").into());
    }
    let mut image = Vec::with_capacity(g.total_sectors() * SECTOR_SIZE);
    for n in 0..g.total_sectors() {
        image.extend_from_slice(media.read_logical_sector(g, n).ok_or(DiskError::CannotRepresent(format, "missing sector"))?);
    }
    Ok(image)
}

pub fn repr(media: &DiskMedia) -> anyhow::Result<Vec<u8>> {
    sectors(media, &media.logical_geometry(), ImageFormat::V9t9)
}
