// Copyright © 2023 David Caldwell <david@porkrind.org>

// CF7+ compact flash cards hold a row of fixed size volumes. Each volume is a 1600 sector raw sector
// disk, but stored with only every other byte used (the card is wired to an 8 bit bus through a 16 bit
// interface).

use anyhow::anyhow;

use super::track::{Density, Track};
use super::{v9t9, DiskMedia, Geometry, ImageFormat, MAX_SIDES, SECTOR_SIZE};

pub const VOLUME_SIZE: usize = 0x0640 * 512;

pub const CF7_GEOMETRY: Geometry = Geometry { tracks: 40, sides: 2, sectors: 20, density: Density::Double };

fn volume_start(volume: usize) -> anyhow::Result<usize> {
    match volume {
        0 => Err(anyhow!("CF7 volumes are numbered from 1")),
        v => (v - 1).checked_mul(VOLUME_SIZE)
            .filter(|start| start.checked_add(VOLUME_SIZE).is_some())
            .ok_or(anyhow!("CF7 volume {} is out of range", v)),
    }
}

/// Pulls the sector data for one volume out of a card image.
pub fn volume(image: &[u8], volume: usize) -> anyhow::Result<Vec<u8>> {
    let start = volume_start(volume)?;
    let raw = image.get(start..start + VOLUME_SIZE)
        .ok_or(anyhow!("CF7 image has no volume {} ({} bytes)", volume, image.len()))?;
    Ok(raw.iter().step_by(2).copied().collect())
}

pub fn from_bytes(image: &[u8], vol: usize) -> anyhow::Result<[Vec<Track>; MAX_SIDES]> {
    let data = volume(image, vol)?;
    Ok(v9t9::tracks_from_sectors(&data, &CF7_GEOMETRY))
}

/// Writes the volume into `container` (which may hold other volumes) and returns the whole thing.
pub fn repr(media: &DiskMedia, mut container: Vec<u8>, vol: usize) -> anyhow::Result<Vec<u8>> {
    let start = volume_start(vol)?;
    let data = v9t9::sectors(media, &CF7_GEOMETRY, ImageFormat::Cf7)?;
    if container.len() < start + VOLUME_SIZE {
        container.resize(start + VOLUME_SIZE, 0);
    }
    for (i, b) in data.iter().enumerate() {
        container[start + i * 2] = *b;
    }
    Ok(container)
}
