// Copyright © 2023 David Caldwell <david@porkrind.org>

// Raw track representation. A track is kept exactly as it would come off the drive head: index gap,
// sync runs, address marks, ID fields, data fields and trailing filler. Sectors are indexed as offsets
// into that buffer so that the buffer itself is the single source of truth.

use std::fmt::Debug;

use pretty_hex::PrettyHex;

pub const MAX_SECTORS: usize = 36;
pub const MAX_TRACK_SIZE: usize = 15000;

pub const ID_MARK: u8 = 0xFE;
pub const DATA_MARK: u8 = 0xFB;
pub const DELETED_DATA_MARK: u8 = 0xF8;
pub const CRC_PLACEHOLDER: u8 = 0xF7;
pub const MFM_PREAMBLE: [u8; 3] = [0xA1, 0xA1, 0xA1];

// ID field: mark, C, H, R, N, CRC, CRC
const ID_FIELD_LEN: usize = 7;
// Anything further than this from the ID field isn't this sector's data field
const MAX_ID_TO_DATA: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Density {
    #[default]
    Single,
    Double,
    Mixed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    pub gap0: usize,
    pub sync: usize,
    pub gap2: usize,
    pub gap3: usize,
    pub track_size: usize,
    pub gap_byte: u8,
    pub preamble: bool,
    pub interleave: usize,
}

pub const FM_LAYOUT: Layout = Layout {
    gap0: 16,
    sync: 6,
    gap2: 11,
    gap3: 45,
    track_size: 3253,
    gap_byte: 0xFF,
    preamble: false,
    interleave: 7,
};

pub const MFM_LAYOUT: Layout = Layout {
    gap0: 40,
    sync: 10,
    gap2: 22,
    gap3: 24,
    track_size: 6872,
    gap_byte: 0x4E,
    preamble: true,
    interleave: 11,
};

impl Density {
    pub fn layout(&self) -> &'static Layout {
        match self {
            Density::Single => &FM_LAYOUT,
            Density::Double | Density::Mixed => &MFM_LAYOUT,
        }
    }

    // Shortest run of sync bytes we accept in front of an address mark. Irregular captures often have
    // truncated sync fields, so only ask for half of what a formatter writes.
    pub fn min_sync(&self) -> usize {
        match self {
            Density::Single | Density::Mixed => FM_LAYOUT.sync / 2,
            Density::Double => MFM_LAYOUT.sync / 2,
        }
    }

    // The first byte of a track is the index gap, and the gap byte differs between FM and MFM.
    pub fn from_gap_byte(b: u8) -> Density {
        match b {
            0x4E => Density::Double,
            _ => Density::Single,
        }
    }
}

impl Layout {
    // Bytes occupied by one standard sector of `len` payload bytes, including its trailing gap.
    pub fn sector_span(&self, len: usize) -> usize {
        let preamble = if self.preamble { MFM_PREAMBLE.len() } else { 0 };
        self.sync + preamble + ID_FIELD_LEN + self.gap2 + self.sync + preamble + 1 + len + 2 + self.gap3
    }

    // Filler after the last sector of a standard track.
    pub fn filler(&self) -> usize {
        let standard_sectors = if self.preamble { 18 } else { 9 };
        self.track_size - self.gap0 - standard_sectors * self.sector_span(256)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SectorId {
    pub cylinder: u8,
    pub side: u8,
    pub sector: u8,
    pub size: u8,
}

impl SectorId {
    pub fn len(&self) -> usize {
        128 << (self.size & 0x03)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sector {
    pub id: SectorId,
    pub data_mark: u8,
    pub offset: usize, // Start of the payload within the track buffer
}

impl Sector {
    pub fn len(&self) -> usize {
        self.id.len()
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len()
    }

    pub fn is_deleted(&self) -> bool {
        self.data_mark != DATA_MARK
    }
}

// Used to build a track from scratch.
#[derive(Clone, Debug)]
pub struct NewSector {
    pub id: SectorId,
    pub data_mark: u8,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkKind {
    Id,
    Data,
}

impl MarkKind {
    fn matches(&self, b: u8) -> bool {
        match self {
            MarkKind::Id => b == ID_MARK,
            MarkKind::Data => b & 0xFC == DELETED_DATA_MARK, // F8-FB: deleted, user defined and normal data
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressMark {
    pub sync_start: usize,
    pub offset: usize,
    pub preamble: bool,
    pub mark: u8,
}

/// Scans `data` from `from` for a run of at least `min_sync` zero bytes, optionally followed by the MFM
/// `A1 A1 A1` preamble, followed by an address mark of the requested kind.
pub fn find_address_mark(data: &[u8], from: usize, min_sync: usize, kind: MarkKind) -> Option<AddressMark> {
    let mut i = from;
    while i < data.len() {
        if data[i] != 0x00 {
            i += 1;
            continue;
        }
        let sync_start = i;
        while i < data.len() && data[i] == 0x00 {
            i += 1;
        }
        if i - sync_start < min_sync {
            continue;
        }
        let mut mark = i;
        let preamble = data.get(mark..mark + MFM_PREAMBLE.len()) == Some(&MFM_PREAMBLE[..]);
        if preamble {
            mark += MFM_PREAMBLE.len();
        }
        match data.get(mark) {
            Some(&b) if kind.matches(b) => return Some(AddressMark { sync_start, offset: mark, preamble, mark: b }),
            _ => {},
        }
    }
    None
}

// Locates the data field belonging to the ID field at `id`. Returns the data mark and the end of the
// data field (after its CRC).
fn data_field(data: &[u8], id: &AddressMark, min_sync: usize, len: usize) -> Option<(AddressMark, usize)> {
    let dam = find_address_mark(data, id.offset + ID_FIELD_LEN, min_sync, MarkKind::Data)?;
    if dam.offset - id.offset > MAX_ID_TO_DATA {
        return None;
    }
    let end = dam.offset + 1 + len;
    if end > data.len() {
        return None;
    }
    Some((dam, (end + 2).min(data.len())))
}

fn read_id(data: &[u8], id: &AddressMark) -> Option<SectorId> {
    let f = data.get(id.offset + 1..id.offset + 5)?;
    Some(SectorId { cylinder: f[0], side: f[1], sector: f[2], size: f[3] })
}

/// Finds where the track starting at `start` ends in a continuous stream of raw tracks.
///
/// ID fields are walked one at a time. When the gap before an ID field is larger than 75% of the
/// nominal end-of-track filler, that gap is the filler + index gap between two tracks and the track
/// ends just before the next track's index gap. If there's no such gap the nominal track size wins.
pub fn find_end_of_track(data: &[u8], start: usize, density: Density) -> usize {
    let layout = density.layout();
    let nominal_end = (start + layout.track_size).min(data.len());
    let threshold = layout.filler() * 3 / 4;
    let min_sync = density.min_sync();

    let mut pos = start;
    let mut prev_end: Option<usize> = None;
    while let Some(id) = find_address_mark(data, pos, min_sync, MarkKind::Id) {
        match prev_end {
            None if id.sync_start >= nominal_end => break, // Unformatted track
            Some(prev) if id.sync_start - prev > threshold => {
                let boundary = id.sync_start.saturating_sub(layout.gap0).max(prev);
                // A gap that could hold a whole track means there are unformatted tracks in between.
                if boundary - prev > layout.filler() + layout.track_size / 2 {
                    return nominal_end.max(prev);
                }
                return boundary;
            },
            _ => {},
        }
        let after_id = id.offset + ID_FIELD_LEN;
        let end = read_id(data, &id)
            .and_then(|sid| data_field(data, &id, min_sync, sid.len()))
            .map(|(_, end)| end)
            .unwrap_or(after_id);
        prev_end = Some(end);
        pos = end;
    }
    match prev_end {
        Some(prev) => prev.max(nominal_end),
        None => nominal_end,
    }
}

#[derive(Clone, PartialEq, Eq, Default)]
pub struct Track {
    pub density: Density,
    pub sectors: Vec<Sector>,
    pub data: Vec<u8>,
}

impl Track {
    /// An unformatted track: nothing but gap bytes.
    pub fn blank(density: Density) -> Track {
        let layout = density.layout();
        Track { density, sectors: vec![], data: vec![layout.gap_byte; layout.track_size] }
    }

    /// Decodes a raw track. The buffer is taken as-is; only the sector index is derived from it.
    pub fn from_raw(data: Vec<u8>) -> Track {
        let mut t = Track { density: Density::Single, sectors: vec![], data };
        t.rebuild();
        t
    }

    /// Re-derives density and the sector index from the raw buffer. Called whenever the buffer has been
    /// rewritten, so no stale offsets survive.
    pub fn rebuild(&mut self) {
        self.data.truncate(MAX_TRACK_SIZE);
        let guess = self.data.first().map(|b| Density::from_gap_byte(*b)).unwrap_or_default();
        self.sectors.clear();
        let (mut fm, mut mfm) = (false, false);
        let min_sync = guess.min_sync().min(Density::Single.min_sync());
        let mut pos = 0;
        while self.sectors.len() < MAX_SECTORS {
            let Some(id) = find_address_mark(&self.data, pos, min_sync, MarkKind::Id) else { break };
            pos = id.offset + ID_FIELD_LEN;
            let Some(sid) = read_id(&self.data, &id) else { break };
            let Some((dam, end)) = data_field(&self.data, &id, min_sync, sid.len()) else { continue };
            if id.preamble { mfm = true } else { fm = true }
            self.sectors.push(Sector { id: sid, data_mark: dam.mark, offset: dam.offset + 1 });
            pos = end;
        }
        self.density = match (fm, mfm) {
            (true, true) => Density::Mixed,
            (false, true) => Density::Double,
            (true, false) => Density::Single,
            (false, false) => guess,
        };
    }

    /// Builds a fully encoded track. Sectors are laid down in the order given.
    pub fn format(density: Density, sectors: &[NewSector]) -> Track {
        let layout = density.layout();
        let gap = layout.gap_byte;
        let mut data = Vec::with_capacity(layout.track_size);
        let mut index = Vec::with_capacity(sectors.len());
        data.extend(std::iter::repeat(gap).take(layout.gap0));
        for s in sectors.iter().take(MAX_SECTORS) {
            let len = s.id.len();
            data.extend(std::iter::repeat(0x00).take(layout.sync));
            if layout.preamble { data.extend_from_slice(&MFM_PREAMBLE) }
            data.extend_from_slice(&[ID_MARK, s.id.cylinder, s.id.side, s.id.sector, s.id.size, CRC_PLACEHOLDER, CRC_PLACEHOLDER]);
            data.extend(std::iter::repeat(gap).take(layout.gap2));
            data.extend(std::iter::repeat(0x00).take(layout.sync));
            if layout.preamble { data.extend_from_slice(&MFM_PREAMBLE) }
            data.push(s.data_mark);
            index.push(Sector { id: s.id, data_mark: s.data_mark, offset: data.len() });
            data.extend(s.data.iter().copied().chain(std::iter::repeat(0)).take(len));
            data.extend_from_slice(&[CRC_PLACEHOLDER, CRC_PLACEHOLDER]);
            data.extend(std::iter::repeat(gap).take(layout.gap3));
        }
        if data.len() < layout.track_size {
            data.resize(layout.track_size, gap);
        }
        data.truncate(MAX_TRACK_SIZE);
        index.retain(|s| s.offset + s.len() <= data.len());
        Track { density, sectors: index, data }
    }

    pub fn find(&self, sector: u8, cylinder: u8) -> Option<&Sector> {
        self.sectors.iter().find(|s| s.id.sector == sector && s.id.cylinder == cylinder)
    }

    pub fn sector_data(&self, s: &Sector) -> &[u8] {
        &self.data[s.range()]
    }

    /// Overwrites a sector's payload (and optionally its data mark). Returns whether anything changed.
    pub fn write_sector(&mut self, index: usize, buf: &[u8], data_mark: Option<u8>) -> bool {
        let s = self.sectors[index];
        let len = buf.len().min(s.len());
        let mut changed = self.data[s.offset..s.offset + len] != buf[..len];
        self.data[s.offset..s.offset + len].copy_from_slice(&buf[..len]);
        if let Some(mark) = data_mark {
            if mark != s.data_mark {
                self.data[s.offset - 1] = mark;
                self.sectors[index].data_mark = mark;
                changed = true;
            }
        }
        changed
    }
}

/// Physical sector order for a track with `count` sectors, e.g. 0 7 5 3 1 8 6 4 2 for FM.
pub fn interleave(count: usize, step: usize) -> Vec<u8> {
    fn gcd(a: usize, b: usize) -> usize { if b == 0 { a } else { gcd(b, a % b) } }
    let step = if count > 0 && gcd(step % count.max(1), count) == 1 { step % count } else { 1 };
    (0..count).map(|i| (i * step % count.max(1)) as u8).collect()
}

impl Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            write!(f, "Track {:?}, {} bytes, {} sectors\n", self.density, self.data.len(), self.sectors.len())?;
            for s in self.sectors.iter() {
                write!(f, "  C{:<3} H{} R{:<3} N{} mark {:02x} @ {}\n", s.id.cylinder, s.id.side, s.id.sector, s.id.size, s.data_mark, s.offset)?;
            }
            write!(f, "{:?}", self.data.hex_dump())
        } else {
            f.debug_struct("Track")
                .field("density", &self.density)
                .field("sectors", &self.sectors)
                .field("len",     &self.data.len())
                .finish()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sectors(cylinder: u8, count: u8) -> Vec<NewSector> {
        (0..count).map(|s| NewSector {
            id: SectorId { cylinder, side: 0, sector: s, size: 1 },
            data_mark: DATA_MARK,
            data: vec![s; 256],
        }).collect()
    }

    #[test]
    fn test_layout_fillers() {
        assert_eq!(231, FM_LAYOUT.filler());
        assert_eq!(334, FM_LAYOUT.sector_span(256));
        assert!(MFM_LAYOUT.filler() > MFM_LAYOUT.gap3 * 4);
    }

    #[test]
    fn test_interleave() {
        assert_eq!(vec![0, 7, 5, 3, 1, 8, 6, 4, 2], interleave(9, 7));
        assert_eq!(vec![0, 11, 4, 15, 8, 1, 12, 5, 16, 9, 2, 13, 6, 17, 10, 3, 14, 7], interleave(18, 11));
        assert_eq!(vec![0, 1, 2, 3], interleave(4, 2)); // step shares a factor with count
    }

    #[test]
    fn test_format_fm() {
        let t = Track::format(Density::Single, &sectors(3, 9));
        assert_eq!(3253, t.data.len());
        assert_eq!(9, t.sectors.len());
        assert_eq!(&[0xFF; 16][..], &t.data[..16]);
        assert_eq!(&[0x00; 6][..], &t.data[16..22]);
        assert_eq!(&[ID_MARK, 3, 0, 0, 1, 0xF7, 0xF7][..], &t.data[22..29]);
        let s = t.find(4, 3).expect("sector 4");
        assert_eq!(&[4; 256][..], t.sector_data(s));
        assert_eq!(DATA_MARK, t.data[s.offset - 1]);
        assert!(t.find(4, 2).is_none());
    }

    #[test]
    fn test_decode_matches_format() {
        for density in [Density::Single, Density::Double] {
            let count = if density == Density::Single { 9 } else { 18 };
            let formatted = Track::format(density, &sectors(7, count));
            let decoded = Track::from_raw(formatted.data.clone());
            assert_eq!(formatted, decoded);
        }
    }

    #[test]
    fn test_find_address_mark_masks_data_marks() {
        let mut raw = vec![0xFF; 8];
        raw.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0xF8, 1, 2]);
        let m = find_address_mark(&raw, 0, 3, MarkKind::Data).expect("deleted data mark");
        assert_eq!(14, m.offset);
        assert_eq!(8, m.sync_start);
        assert_eq!(0xF8, m.mark);
        assert!(find_address_mark(&raw, 0, 3, MarkKind::Id).is_none());
        assert!(find_address_mark(&raw, 0, 7, MarkKind::Data).is_none()); // sync too short
    }

    #[test]
    fn test_find_address_mark_mfm_preamble() {
        let mut raw = vec![0x4E; 4];
        raw.extend_from_slice(&[0; 10]);
        raw.extend_from_slice(&[0xA1, 0xA1, 0xA1, 0xFE]);
        let m = find_address_mark(&raw, 0, 5, MarkKind::Id).expect("id mark");
        assert!(m.preamble);
        assert_eq!(17, m.offset);
    }

    #[test]
    fn test_end_of_track_standard() {
        let mut stream = Track::format(Density::Single, &sectors(0, 9)).data;
        stream.extend(Track::format(Density::Single, &sectors(1, 9)).data);
        assert_eq!(3253, find_end_of_track(&stream, 0, Density::Single));
        assert_eq!(6506, find_end_of_track(&stream, 3253, Density::Single));
    }

    #[test]
    fn test_end_of_track_irregular() {
        // Over-long capture: the filler runs well past the nominal track size.
        let mut long = Track::format(Density::Single, &sectors(0, 9)).data;
        long.extend([0xFF; 300]);
        let mut stream = long.clone();
        stream.extend(Track::format(Density::Single, &sectors(1, 9)).data);
        assert_eq!(long.len(), find_end_of_track(&stream, 0, Density::Single));

        // Non-standard sector sizes.
        let big: Vec<NewSector> = (0..5).map(|s| NewSector {
            id: SectorId { cylinder: 0, side: 0, sector: s, size: 2 },
            data_mark: DATA_MARK,
            data: vec![0xE5; 512],
        }).collect();
        let mut stream = Track::format(Density::Single, &big).data;
        stream.extend(Track::format(Density::Single, &sectors(1, 9)).data);
        let end = find_end_of_track(&stream, 0, Density::Single);
        assert_eq!(3253, end);
        let t = Track::from_raw(stream[..end].to_vec());
        assert_eq!(5, t.sectors.len());
        assert_eq!(512, t.sectors[4].len());
    }

    #[test]
    fn test_end_of_track_blank() {
        let mut stream = Track::blank(Density::Single).data;
        stream.extend(Track::format(Density::Single, &sectors(1, 9)).data);
        assert_eq!(3253, find_end_of_track(&stream, 0, Density::Single));
    }

    #[test]
    fn test_rebuild_after_overwrite() {
        let mut t = Track::format(Density::Single, &sectors(0, 9));
        let replacement = Track::format(Density::Double, &sectors(0, 18)).data;
        t.data.clear();
        t.data.extend_from_slice(&replacement);
        t.rebuild();
        assert_eq!(Density::Double, t.density);
        assert_eq!(18, t.sectors.len());
        assert_eq!(&[17; 256][..], t.sector_data(t.find(17, 0).unwrap()));
    }

    #[test]
    fn test_write_sector_mark() {
        let mut t = Track::format(Density::Single, &sectors(0, 9));
        let i = t.sectors.iter().position(|s| s.id.sector == 2).unwrap();
        assert!(!t.write_sector(i, &[2; 256], None));
        assert!(t.write_sector(i, &[9; 256], Some(DELETED_DATA_MARK)));
        let rebuilt = Track::from_raw(t.data.clone());
        let s = rebuilt.find(2, 0).unwrap();
        assert!(s.is_deleted());
        assert_eq!(&[9; 256][..], rebuilt.sector_data(s));
    }
}
