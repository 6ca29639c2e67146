// Copyright © 2023 David Caldwell <david@porkrind.org>

// File Descriptor Records. One sector per file, holding its name, type, size and the CHAIN: a table of up
// to 76 runs of contiguous sectors (data chain pointer blocks in the TI manuals).

use std::fmt::Debug;

use anyhow::anyhow;
use bytebuffer::{ByteBuffer, Endian};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

// Things we override to make testing easier
#[cfg(not(test))] use chrono::Local;
#[cfg    (test)]  use super::test::Local;

use crate::block::SECTOR_SIZE;
use crate::error::DiskError;

pub const NAME_LEN: usize = 10;
pub const MAX_CHAIN: usize = 76;
const CHAIN_OFFSET: usize = 0x1C;

pub const PROGRAM:       u8 = 0x01;
pub const INTERNAL:      u8 = 0x02;
pub const WRITE_PROTECT: u8 = 0x08;
pub const BACKUP:        u8 = 0x10;
pub const VARIABLE:      u8 = 0x80;

/// One CHAIN entry: a run starting at `start` that ends when the file's running sector count reaches
/// `end_offset + 1`. Both are 12 bits on disk, packed into 3 bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Chain {
    pub start: u16,
    pub end_offset: u16,
}

impl Chain {
    pub fn from_repr(b: [u8; 3]) -> Chain {
        Chain {
            start: b[0] as u16 | (b[1] as u16 & 0x0F) << 8,
            end_offset: (b[2] as u16) << 4 | (b[1] as u16) >> 4,
        }
    }

    pub fn repr(&self) -> [u8; 3] {
        [(self.start & 0xFF) as u8,
         ((self.end_offset & 0x0F) << 4 | (self.start >> 8) & 0x0F) as u8,
         (self.end_offset >> 4) as u8]
    }

    pub fn run_end_count(&self) -> usize {
        self.end_offset as usize + 1
    }
}

/// Time and date words as the TI disk controller stores them. All zero means "not recorded".
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp(pub [u8; 4]);

impl Timestamp {
    pub fn decode(&self) -> Option<NaiveDateTime> {
        let time = u16::from_be_bytes([self.0[0], self.0[1]]);
        let date = u16::from_be_bytes([self.0[2], self.0[3]]);
        if time == 0 && date == 0 {
            return None;
        }
        let year = (date >> 9) as i32;
        let year = if year >= 80 { 1900 + year } else { 2000 + year };
        NaiveDate::from_ymd_opt(year, (date >> 5 & 0x0F) as u32, (date & 0x1F) as u32)?
            .and_hms_opt((time >> 11) as u32, (time >> 5 & 0x3F) as u32, (time & 0x1F) as u32 * 2)
    }

    pub fn encode(when: NaiveDateTime) -> Timestamp {
        let time = (when.hour() << 11 | when.minute() << 5 | when.second() / 2) as u16;
        let date = ((when.year().rem_euclid(100) as u32) << 9 | when.month() << 5 | when.day()) as u16;
        let (t, d) = (time.to_be_bytes(), date.to_be_bytes());
        Timestamp([t[0], t[1], d[0], d[1]])
    }

    pub fn now() -> Timestamp {
        Timestamp::encode(Local::now().naive_local())
    }
}

impl Debug for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.decode() {
            Some(d) => write!(f, "{}", d.format("%Y-%m-%d %H:%M:%S")),
            None if self.0 == [0; 4] => write!(f, "-"),
            None => write!(f, "?{:02x?}", self.0),
        }
    }
}

/// True for a name made of printable characters other than space and `.`, padded with trailing spaces.
pub fn is_valid_name(raw: &[u8]) -> bool {
    let len = raw.iter().rposition(|&c| c != b' ').map(|p| p + 1).unwrap_or(0);
    len > 0 && raw.len() <= NAME_LEN && raw[..len].iter().all(|&c| c > b' ' && c < 0x7F && c != b'.')
}

pub fn encode_name(name: &str) -> anyhow::Result<[u8; NAME_LEN]> {
    let bytes = name.as_bytes();
    if !is_valid_name(bytes) {
        return Err(DiskError::InvalidName(name.to_owned()).into());
    }
    let mut raw = [b' '; NAME_LEN];
    raw[..bytes.len()].copy_from_slice(bytes);
    Ok(raw)
}

pub fn decode_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim_end().to_owned()
}

#[derive(Clone, PartialEq, Eq)]
pub struct Fdr {
    pub name: [u8; NAME_LEN],
    pub extended_record_length: u16,
    pub flags: u8,
    pub records_per_sector: u8,
    pub total_sectors: u16,
    pub eof_offset: u8,
    pub record_length: u8,
    pub fixed_records: u16,
    pub created: Timestamp,
    pub updated: Timestamp,
    pub chain: [Chain; MAX_CHAIN],
}

impl Fdr {
    /// An empty file. `record_length` 0 with a PROGRAM flag makes a program image.
    pub fn new(name: &str, flags: u8, record_length: u8) -> anyhow::Result<Fdr> {
        let now = Timestamp::now();
        Ok(Fdr {
            name: encode_name(name)?,
            extended_record_length: 0,
            flags,
            records_per_sector: match (flags & PROGRAM, flags & VARIABLE, record_length) {
                (PROGRAM, _, _) | (_, _, 0) => 0,
                (_, VARIABLE, l) => (SECTOR_SIZE / (l as usize + 1)) as u8,
                (_, _, l) => (SECTOR_SIZE / l as usize) as u8,
            },
            total_sectors: 0,
            eof_offset: 0,
            record_length,
            fixed_records: 0,
            created: now,
            updated: now,
            chain: [Chain::default(); MAX_CHAIN],
        })
    }

    pub fn from_repr(raw: &[u8]) -> anyhow::Result<Fdr> {
        let mut buf = ByteBuffer::from_bytes(raw);
        buf.set_endian(Endian::BigEndian);
        Ok(Fdr {
            name: buf.read_bytes(NAME_LEN)?.try_into().map_err(|_| anyhow!("short name"))?,
            extended_record_length: buf.read_u16()?,
            flags: buf.read_u8()?,
            records_per_sector: buf.read_u8()?,
            total_sectors: buf.read_u16()?,
            eof_offset: buf.read_u8()?,
            record_length: buf.read_u8()?,
            fixed_records: {
                // The only little endian field on the disk.
                buf.set_endian(Endian::LittleEndian);
                let n = buf.read_u16()?;
                buf.set_endian(Endian::BigEndian);
                n
            },
            created: Timestamp(buf.read_bytes(4)?.try_into().map_err(|_| anyhow!("short timestamp"))?),
            updated: Timestamp(buf.read_bytes(4)?.try_into().map_err(|_| anyhow!("short timestamp"))?),
            chain: {
                debug_assert_eq!(CHAIN_OFFSET, buf.get_rpos());
                let mut chain = [Chain::default(); MAX_CHAIN];
                for c in chain.iter_mut() {
                    let b = buf.read_bytes(3)?;
                    *c = Chain::from_repr([b[0], b[1], b[2]]);
                }
                chain
            },
        })
    }

    pub fn repr(&self) -> Vec<u8> {
        let mut buf = ByteBuffer::new();
        buf.set_endian(Endian::BigEndian);
        buf.write_bytes(&self.name);
        buf.write_u16(self.extended_record_length);
        buf.write_u8(self.flags);
        buf.write_u8(self.records_per_sector);
        buf.write_u16(self.total_sectors);
        buf.write_u8(self.eof_offset);
        buf.write_u8(self.record_length);
        buf.write_bytes(&self.fixed_records.to_le_bytes());
        buf.write_bytes(&self.created.0);
        buf.write_bytes(&self.updated.0);
        for c in self.chain.iter() {
            buf.write_bytes(&c.repr());
        }
        let mut v = buf.into_vec();
        v.resize(SECTOR_SIZE, 0);
        v
    }

    pub fn name(&self) -> String {
        decode_name(&self.name)
    }

    /// Number of CHAIN entries in use, or None if the table doesn't add up to `total_sectors`.
    pub fn chain_len(&self) -> Option<usize> {
        let total = self.total_sectors as usize;
        let mut count = 0;
        for (i, c) in self.chain.iter().enumerate() {
            if count == total {
                return Some(i);
            }
            if c.run_end_count() <= count || c.run_end_count() > total {
                return None;
            }
            count = c.run_end_count();
        }
        (count == total).then_some(MAX_CHAIN)
    }

    pub fn is_valid(&self) -> bool {
        is_valid_name(&self.name) && self.is_valid_type() && self.chain_len().is_some()
    }

    // Programs have no records. Data records have to fit in a sector. A variable file's record count is a
    // count of sectors in use, so it can't exceed the sectors it has.
    fn is_valid_type(&self) -> bool {
        match self.is_program() {
            true => self.flags & (INTERNAL | VARIABLE) == 0 && self.records_per_sector == 0,
            false => self.records_per_sector as usize * self.record_length as usize <= SECTOR_SIZE
                && (!self.is_variable() || self.fixed_records <= self.total_sectors),
        }
    }

    /// The used CHAIN entries, each with the file sector index it starts at.
    pub fn runs(&self) -> impl Iterator<Item = (usize/*first index*/, Chain)> + '_ {
        let used = self.chain_len().unwrap_or(0);
        self.chain[..used].iter().scan(0, |first, c| {
            let r = (*first, *c);
            *first = c.run_end_count();
            Some(r)
        })
    }

    /// Every sector of the file, in file order.
    pub fn sectors(&self) -> impl Iterator<Item = usize> + '_ {
        self.runs().flat_map(|(first, c)| (0..c.run_end_count() - first).map(move |i| c.start as usize + i))
    }

    /// Physical sector holding file sector `index`.
    pub fn get_sector(&self, index: usize) -> Option<usize> {
        self.runs()
            .find(|(_, c)| index < c.run_end_count())
            .map(|(first, c)| c.start as usize + index - first)
    }

    /// Appends `sector` to the file, growing the last run if it's contiguous. False if the CHAIN is full.
    pub fn add_sector(&mut self, sector: usize) -> bool {
        let Some(used) = self.chain_len() else { return false };
        if sector > 0x0FFF || self.total_sectors as usize >= 0x1000 {
            return false;
        }
        let next = self.runs().last().map(|(first, c)| c.start as usize + c.run_end_count() - first);
        match next {
            Some(n) if n == sector => {
                self.chain[used - 1].end_offset += 1;
            },
            _ if used < MAX_CHAIN => {
                self.chain[used] = Chain { start: sector as u16, end_offset: self.total_sectors };
            },
            _ => return false,
        }
        self.total_sectors += 1;
        true
    }

    /// Shortens the file to `sectors` sectors and returns the ones it no longer uses.
    pub fn truncate(&mut self, sectors: usize) -> Vec<usize> {
        if sectors >= self.total_sectors as usize {
            return vec![];
        }
        let freed: Vec<usize> = self.sectors().skip(sectors).collect();
        let used = self.chain_len().unwrap_or(0);
        let keep = self.runs().take_while(|(first, _)| *first < sectors).count();
        for c in self.chain[keep..used].iter_mut() {
            *c = Chain::default();
        }
        if keep > 0 {
            self.chain[keep - 1].end_offset = (sectors - 1) as u16;
        }
        self.total_sectors = sectors as u16;
        freed
    }

    pub fn is_program(&self) -> bool  { self.flags & PROGRAM != 0 }
    pub fn is_internal(&self) -> bool { self.flags & INTERNAL != 0 }
    pub fn is_variable(&self) -> bool { self.flags & VARIABLE != 0 }
    pub fn is_protected(&self) -> bool { self.flags & WRITE_PROTECT != 0 }

    /// "PROGRAM", "DIS/FIX 80", "INT/VAR 254", ...
    pub fn file_type(&self) -> String {
        match self.is_program() {
            true => "PROGRAM".to_owned(),
            false => format!("{}/{} {}",
                             if self.is_internal() { "INT" } else { "DIS" },
                             if self.is_variable() { "VAR" } else { "FIX" },
                             self.record_length),
        }
    }

    /// Bytes of file data. Only program files know their length to the byte.
    pub fn len(&self) -> usize {
        let full = self.total_sectors as usize * SECTOR_SIZE;
        match (self.is_program() || self.is_variable(), self.eof_offset) {
            (true, e) if e > 0 && full > 0 => full - SECTOR_SIZE + e as usize,
            _ => full,
        }
    }
}

impl Debug for Fdr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            write!(f, "{:<10} {:<11} {:4} {}{} created {:?} updated {:?}",
                   self.name(), self.file_type(), self.total_sectors,
                   if self.is_protected() { "P" } else { " " },
                   if self.flags & BACKUP != 0 { "B" } else { " " },
                   self.created, self.updated)?;
            for (first, c) in self.runs() {
                write!(f, "\n    {:5}: {} sectors @ {}", first, c.run_end_count() - first, c.start)?;
            }
            if !self.is_valid() {
                write!(f, "\n    (invalid)")?;
            }
            Ok(())
        } else {
            write!(f, "{:<10} {:<11} {:4}", self.name(), self.file_type(), self.total_sectors)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_chain_codec() {
        for start in 0..0x1000u16 {
            for end_offset in [0u16, 1, 0x0F, 0x10, 0x7FF, 0xFFF, start] {
                let c = Chain { start, end_offset };
                assert_eq!(c, Chain::from_repr(c.repr()));
            }
        }
        for count in 1..=0x1000 {
            let c = Chain { start: 0xABC, end_offset: (count - 1) as u16 };
            assert_eq!(count, Chain::from_repr(c.repr()).run_end_count());
        }
        assert_eq!([0x22, 0x21, 0x00], Chain { start: 0x122, end_offset: 2 }.repr());
    }

    #[test]
    fn test_names() {
        assert!(is_valid_name(b"LOAD      "));
        assert!(is_valid_name(b"ABCDEFGHIJ"));
        assert!(!is_valid_name(b"          "));
        assert!(!is_valid_name(b"A.B       "));
        assert!(!is_valid_name(b"A B       "));
        assert!(!is_valid_name(b"ABCDEFGHIJK"));
        assert!(!is_valid_name(&[0u8; 10]));
        assert_eq!(*b"HELLO     ", encode_name("HELLO").unwrap());
        assert!(encode_name("toolongname").is_err());
    }

    #[test]
    fn test_timestamp() {
        let when = NaiveDate::from_ymd_opt(1984, 6, 1).unwrap().and_hms_opt(12, 34, 56).unwrap();
        let ts = Timestamp::encode(when);
        assert_eq!(Some(when), ts.decode());
        assert_eq!([0x64, 0x5C, 0xA8, 0xC1], ts.0);
        let y2k = NaiveDate::from_ymd_opt(2023, 2, 28).unwrap().and_hms_opt(0, 0, 0).unwrap();
        assert_eq!(Some(y2k), Timestamp::encode(y2k).decode());
        assert_eq!(None, Timestamp::default().decode());
    }

    #[test]
    fn test_repr_layout() {
        let mut fdr = Fdr::new("DATA", VARIABLE, 80).unwrap();
        fdr.fixed_records = 0x0102;
        assert!(fdr.add_sector(0x122));
        assert!(fdr.add_sector(0x123));
        let raw = fdr.repr();
        assert_eq!(SECTOR_SIZE, raw.len());
        assert_eq!(b"DATA      ", &raw[..10]);
        assert_eq!(VARIABLE, raw[0x0C]);
        assert_eq!(3, raw[0x0D]);
        assert_eq!([0x00, 0x02], raw[0x0E..0x10]);
        assert_eq!(80, raw[0x11]);
        assert_eq!([0x02, 0x01], raw[0x12..0x14]);
        assert_eq!([0x22, 0x11, 0x00], raw[0x1C..0x1F]);
        assert_eq!(fdr, Fdr::from_repr(&raw).unwrap());
        assert_eq!("DIS/VAR 80", fdr.file_type());
    }

    #[test]
    fn test_add_and_get_sector() {
        let mut fdr = Fdr::new("F", 0, 80).unwrap();
        for s in [34, 35, 36, 50, 51, 40] {
            assert!(fdr.add_sector(s));
        }
        assert_eq!(Some(3), fdr.chain_len());
        assert_eq!(vec![34, 35, 36, 50, 51, 40], fdr.sectors().collect::<Vec<_>>());
        assert_eq!(Some(36), fdr.get_sector(2));
        assert_eq!(Some(50), fdr.get_sector(3));
        assert_eq!(Some(40), fdr.get_sector(5));
        assert_eq!(None, fdr.get_sector(6));
    }

    #[test]
    fn test_chain_full() {
        let mut fdr = Fdr::new("F", 0, 80).unwrap();
        for i in 0..MAX_CHAIN {
            assert!(fdr.add_sector(100 + i * 2));
        }
        let before = fdr.clone();
        assert!(!fdr.add_sector(300));
        assert_eq!(before, fdr);
        assert!(fdr.add_sector(100 + (MAX_CHAIN - 1) * 2 + 1)); // Still room to grow the last run
        assert_eq!(Some(MAX_CHAIN), fdr.chain_len());
        assert!(fdr.is_valid());
    }

    #[test]
    fn test_inconsistent_chain() {
        let mut fdr = Fdr::new("F", 0, 80).unwrap();
        fdr.add_sector(34);
        fdr.add_sector(35);
        fdr.total_sectors = 3;
        assert!(!fdr.is_valid());
        assert_eq!(0, fdr.sectors().count());
        fdr.total_sectors = 2;
        fdr.chain[1] = Chain { start: 40, end_offset: 0 }; // Ignored: the table ended already
        assert!(fdr.is_valid());
        let mut fdr = Fdr::new("F", 0, 80).unwrap();
        fdr.total_sectors = 2;
        fdr.chain[0] = Chain { start: 40, end_offset: 1 };
        fdr.chain[1] = Chain { start: 50, end_offset: 0 };
        assert_eq!(Some(1), fdr.chain_len());
    }

    #[test]
    fn test_type_rules() {
        let mut prog = Fdr::new("PROG", PROGRAM, 0).unwrap();
        prog.add_sector(34);
        assert!(prog.is_valid());
        for bad in [INTERNAL, VARIABLE, INTERNAL | VARIABLE] {
            let mut p = prog.clone();
            p.flags |= bad;
            assert!(!p.is_valid(), "flags {:02x}", p.flags);
        }
        let mut p = prog.clone();
        p.records_per_sector = 5;
        assert!(!p.is_valid());

        let mut data = Fdr::new("DATA", INTERNAL, 128).unwrap();
        assert_eq!(2, data.records_per_sector);
        assert!(data.is_valid());
        data.records_per_sector = 3;
        assert!(!data.is_valid());
        data.records_per_sector = 9;
        data.record_length = 200;
        assert!(!data.is_valid());
        data.records_per_sector = 1;
        data.record_length = 255;
        assert!(data.is_valid());
        data.fixed_records = 500; // Fixed files don't use it as a sector count
        assert!(data.is_valid());

        let mut var = Fdr::new("LOG", VARIABLE, 80).unwrap();
        var.add_sector(34);
        var.add_sector(35);
        var.fixed_records = 2;
        assert!(var.is_valid());
        var.fixed_records = 3;
        assert!(!var.is_valid());
        assert!(!Fdr::from_repr(&var.repr()).unwrap().is_valid());
    }

    #[test]
    fn test_truncate() {
        let mut fdr = Fdr::new("F", PROGRAM, 0).unwrap();
        for s in [34, 35, 36, 50, 51, 40] {
            fdr.add_sector(s);
        }
        assert_eq!(vec![51, 40], fdr.truncate(4));
        assert_eq!(vec![34, 35, 36, 50], fdr.sectors().collect::<Vec<_>>());
        assert_eq!(Some(2), fdr.chain_len());
        assert_eq!(Chain::default(), fdr.chain[2]);
        assert_eq!(vec![35, 36, 50], fdr.truncate(1));
        assert_eq!(Some(1), fdr.chain_len());
        assert_eq!(vec![34], fdr.truncate(0));
        assert_eq!(Some(0), fdr.chain_len());
        assert!(fdr.is_valid());
    }

    #[test]
    fn test_program_len() {
        let mut fdr = Fdr::new("PROG", PROGRAM, 0).unwrap();
        assert_eq!("PROGRAM", fdr.file_type());
        fdr.add_sector(34);
        fdr.add_sector(35);
        fdr.eof_offset = 0x10;
        assert_eq!(256 + 16, fdr.len());
        fdr.eof_offset = 0;
        assert_eq!(512, fdr.len());
    }
}
