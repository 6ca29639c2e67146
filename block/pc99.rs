// Copyright © 2023 David Caldwell <david@porkrind.org>

// PC99 raw track images: every track exactly as encoded on the disk, one after the other. Side 0 runs
// tracks 0..N, then side 1 runs back down N-1..0. There's no header, so track boundaries have to be found
// by looking for the gap between the last sector of one track and the first ID field of the next.

use anyhow::anyhow;
use log::debug;

use super::track::{self, Density, Track};
use super::{DiskMedia, Geometry, MAX_SIDES, MAX_TRACKS};

pub fn from_bytes(image: &[u8]) -> anyhow::Result<[Vec<Track>; MAX_SIDES]> {
    let mut chunks: Vec<Track> = vec![];
    let mut pos = 0;
    while pos < image.len() {
        if chunks.len() >= MAX_TRACKS * MAX_SIDES {
            return Err(anyhow!("More than {} tracks in image", MAX_TRACKS * MAX_SIDES));
        }
        let density = Density::from_gap_byte(image[pos]);
        let end = track::find_end_of_track(image, pos, density);
        if end <= pos {
            break;
        }
        if end == image.len() && end - pos < density.layout().track_size {
            return Err(anyhow!("Image truncated in track {} ({} of {} bytes)", chunks.len(), end - pos, density.layout().track_size));
        }
        chunks.push(Track::from_raw(image[pos..end].to_vec()));
        pos = end;
    }
    if chunks.is_empty() {
        return Err(anyhow!("No tracks found"));
    }

    let vib = chunks[0].find(0, 0).map(|s| chunks[0].sector_data(s).to_vec());
    let (tracks, sides) = match vib.as_deref().and_then(Geometry::from_vib) {
        Some(g) if g.tracks * g.sides == chunks.len() => (g.tracks, g.sides),
        _ if chunks.len() <= MAX_TRACKS => (chunks.len(), 1),
        _ if chunks.len() % 2 == 0 => (chunks.len() / 2, 2),
        _ => return Err(anyhow!("{} tracks don't make a one or two sided disk", chunks.len())),
    };
    debug!("PC99: {} tracks found, {} per side, {} sides", chunks.len(), tracks, sides);

    let side1: Vec<Track> = chunks.split_off(tracks.min(chunks.len())).into_iter().rev().collect();
    Ok([chunks, side1])
}

pub fn repr(media: &DiskMedia) -> anyhow::Result<Vec<u8>> {
    Ok(media.tracks(0).iter()
        .chain(media.tracks(1).iter().rev())
        .flat_map(|t| t.data.iter().copied())
        .collect())
}
