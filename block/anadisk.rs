// Copyright © 2023 David Caldwell <david@porkrind.org>

use anyhow::{anyhow, Context};
use bytebuffer::{ByteBuffer, Endian};

use super::track::{Density, NewSector, SectorId, Track, DATA_MARK};
use super::{DiskMedia, MAX_SIDES, MAX_TRACKS};

// AnaDisk dumps don't record the encoding. More sectors than fit on an FM track means MFM.
const MAX_FM_SECTORS: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub actual_cylinder: u8,
    pub actual_side: u8,
    pub id: SectorId,
    pub data: Vec<u8>,
}

impl Record {
    pub fn from_repr(buf: &mut ByteBuffer) -> anyhow::Result<Record> {
        let actual_cylinder = buf.read_u8()?;
        let actual_side = buf.read_u8()?;
        let id = SectorId {
            cylinder: buf.read_u8()?,
            side: buf.read_u8()?,
            sector: buf.read_u8()?,
            size: buf.read_u8()?,
        };
        let len = buf.read_u16()? as usize;
        Ok(Record { actual_cylinder, actual_side, id, data: buf.read_bytes(len)? })
    }

    pub fn repr(&self, buf: &mut ByteBuffer) -> anyhow::Result<()> {
        buf.write_u8(self.actual_cylinder);
        buf.write_u8(self.actual_side);
        buf.write_u8(self.id.cylinder);
        buf.write_u8(self.id.side);
        buf.write_u8(self.id.sector);
        buf.write_u8(self.id.size);
        buf.write_u16(u16::try_from(self.data.len()).with_context(|| format!("Sector {:?} too long", self.id))?);
        buf.write_bytes(&self.data);
        Ok(())
    }
}

pub fn from_bytes(image: &[u8]) -> anyhow::Result<[Vec<Track>; MAX_SIDES]> {
    let mut buf = ByteBuffer::from_bytes(image);
    buf.set_endian(Endian::LittleEndian);

    // Sectors are grouped onto tracks by where they physically were, in the order they were read.
    let mut grouped: [Vec<Vec<Record>>; MAX_SIDES] = Default::default();
    while buf.get_rpos() < buf.len() {
        let r = Record::from_repr(&mut buf).with_context(|| format!("Sector record at offset {}", buf.get_rpos()))?;
        let (c, h) = (r.actual_cylinder as usize, r.actual_side as usize);
        if c >= MAX_TRACKS || h >= MAX_SIDES {
            return Err(anyhow!("Sector {:?} on physical cylinder {} side {} is out of range", r.id, c, h));
        }
        let side = &mut grouped[h];
        if side.len() <= c {
            side.resize_with(c + 1, Vec::new);
        }
        side[c].push(r);
    }
    if grouped.iter().all(|s| s.is_empty()) {
        return Err(anyhow!("No sectors in image"));
    }
    let tracks = grouped[0].len().max(grouped[1].len());

    Ok(grouped.map(|side| match side.is_empty() {
        true => vec![],
        false => (0..tracks).map(|c| {
            let Some(records) = side.get(c).filter(|r| !r.is_empty()) else { return Track::blank(Density::Single) };
            let density = if records.len() > MAX_FM_SECTORS { Density::Double } else { Density::Single };
            Track::format(density, &records.iter().map(|r| NewSector {
                id: r.id,
                data_mark: DATA_MARK,
                data: r.data.clone(),
            }).collect::<Vec<_>>())
        }).collect(),
    }))
}

pub fn repr(media: &DiskMedia) -> anyhow::Result<Vec<u8>> {
    let mut buf = ByteBuffer::new();
    buf.set_endian(Endian::LittleEndian);
    for c in 0..media.num_tracks() {
        for h in 0..MAX_SIDES {
            let Some(track) = media.track(c, h) else { continue };
            for s in track.sectors.iter() {
                Record {
                    actual_cylinder: c as u8,
                    actual_side: h as u8,
                    id: s.id,
                    data: track.sector_data(s).to_vec(),
                }.repr(&mut buf)?;
            }
        }
    }
    Ok(buf.into_vec())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::test::numbered_media;
    use crate::block::{determine_format, ImageFormat, DSDD_GEOMETRY, DSSD_GEOMETRY, SECTOR_SIZE};

    #[test]
    fn test_round_trip() {
        for g in [DSSD_GEOMETRY, DSDD_GEOMETRY] {
            let media = numbered_media(g);
            let image = repr(&media).expect("repr");
            assert_eq!(g.total_sectors() * (8 + SECTOR_SIZE), image.len());
            assert_eq!(ImageFormat::AnaDisk, determine_format(&image));
            let decoded = DiskMedia::from_tracks(ImageFormat::AnaDisk, from_bytes(&image).expect("decode"));
            assert_eq!(g, decoded.geometry());
            for n in 0..g.total_sectors() {
                assert_eq!(media.read_logical_sector(&g, n), decoded.read_logical_sector(&g, n), "sector {}", n);
            }
            assert_eq!(image, repr(&decoded).expect("repr again"));
        }
    }

    #[test]
    fn test_header() {
        let image = repr(&numbered_media(DSSD_GEOMETRY)).unwrap();
        assert_eq!(&[0, 0, 0, 0, 0, 1, 0x00, 0x01][..], &image[..8]);
        // Cylinder major: track 0 side 1 follows track 0 side 0.
        let second_track = 9 * (8 + SECTOR_SIZE);
        assert_eq!(&[0, 1, 0, 1, 0, 1, 0x00, 0x01][..], &image[second_track..second_track + 8]);
    }

    #[test]
    fn test_odd_sizes_and_gaps() {
        let mut image = vec![];
        for (c, h, r, n, len) in [(2u8, 0u8, 7u8, 0u8, 128usize), (2, 0, 1, 2, 512)] {
            image.extend_from_slice(&[c, h, c, h, r, n]);
            image.extend_from_slice(&(len as u16).to_le_bytes());
            image.extend(std::iter::repeat(r).take(len));
        }
        let decoded = DiskMedia::from_tracks(ImageFormat::AnaDisk, from_bytes(&image).unwrap());
        assert_eq!(3, decoded.num_tracks());
        assert_eq!(1, decoded.num_sides());
        assert!(decoded.track(0, 0).unwrap().sectors.is_empty());
        assert_eq!(&[1; 512][..], decoded.read_sector(2, 0, 1, 2).unwrap());
        assert_eq!(vec![7, 1], decoded.track(2, 0).unwrap().sectors.iter().map(|s| s.id.sector).collect::<Vec<_>>());
    }

    #[test]
    fn test_truncated() {
        assert!(from_bytes(&[0, 0, 0, 0, 0, 1, 0x00, 0x01, 0xE5]).is_err());
        assert!(from_bytes(&[]).is_err());
    }
}
