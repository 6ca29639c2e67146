// Copyright © 2023 David Caldwell <david@porkrind.org>

// TI disk filesystem. Sector 0 is the VIB (volume info + allocation bitmap), sector 1 is the root File
// Descriptor Index (a sorted list of FDR sector numbers), and every file has an FDR sector whose CHAIN
// lists the runs of sectors holding its data. Up to 3 subdirectories hang off the VIB, each with its own FDI.

pub mod fdr;
pub mod vib;

use std::fmt::Debug;

use anyhow::Context;
use log::{debug, warn};

use crate::block::{Geometry, SectorDevice, SECTOR_SIZE};
use crate::error::DiskError;
use fdr::Fdr;
use vib::Vib;

pub const VIB_SECTOR: usize = 0;
pub const ROOT_FDI: usize = 1;
pub const FIRST_FDR_SECTOR: usize = 2;
// Where the TI controller starts looking for data sectors. It leaves 2..=33 for FDRs.
pub const FIRST_DATA_SECTOR: usize = 34;
pub const MAX_FILES: usize = 127;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Directory {
    pub name: String, // "" for the root
    pub fdi: usize,
}

/// A file as found in a directory: where its FDR lives, and the FDR itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub fdi: usize,
    pub sector: usize,
    pub fdr: Fdr,
}

impl DirEntry {
    pub fn name(&self) -> String {
        self.fdr.name()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub cross_linked: Vec<usize>,
    pub unallocated_in_use: Vec<usize>,
    pub allocated_unused: Vec<usize>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.cross_linked.is_empty() && self.unallocated_in_use.is_empty() && self.allocated_unused.is_empty()
    }
}

#[derive(Clone)]
pub struct DiskFs<B: SectorDevice> {
    pub image: B,
    pub vib: Vib,
}

impl<B: SectorDevice> DiskFs<B> {
    pub fn open(image: B) -> anyhow::Result<DiskFs<B>> {
        let vib = Vib::from_repr(&image.read_sector(VIB_SECTOR)?).context("Volume Information Block")?;
        debug!("Opened volume {:?}", vib);
        Ok(DiskFs { image, vib })
    }

    pub fn image_is(image: &B) -> bool {
        image.read_sector(VIB_SECTOR).map(|raw| Vib::from_repr(&raw).is_ok()).unwrap_or(false)
    }

    /// Writes an empty filesystem: a VIB and an empty root FDI.
    pub fn format(mut image: B, name: &str, geometry: &Geometry) -> anyhow::Result<DiskFs<B>> {
        let vib = Vib::new(name, geometry)?;
        if vib.total_sectors() > image.sectors() {
            return Err(anyhow::anyhow!("Device has {} sectors, volume needs {}", image.sectors(), vib.total_sectors()));
        }
        image.write_sector(VIB_SECTOR, &vib.repr())?;
        image.write_sector(ROOT_FDI, &[0; SECTOR_SIZE])?;
        Ok(DiskFs { image, vib })
    }

    pub fn total_sectors(&self) -> usize {
        self.vib.total_sectors().min(self.image.sectors())
    }

    fn write_vib(&mut self) -> anyhow::Result<()> {
        self.image.write_sector(VIB_SECTOR, &self.vib.repr())
    }

    pub fn directories(&self) -> Vec<Directory> {
        std::iter::once(Directory { name: "".to_owned(), fdi: ROOT_FDI })
            .chain(self.vib.subdirs().map(|(name, fdi)| Directory { name, fdi }))
            .collect()
    }

    pub fn directory(&self, name: &str) -> anyhow::Result<Directory> {
        self.directories().into_iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
            .ok_or(DiskError::FileNotFound(name.to_owned()).into())
    }

    /// FDR sector pointers in a File Descriptor Index.
    pub fn read_fdi(&self, fdi: usize) -> anyhow::Result<Vec<usize>> {
        let raw = self.image.read_sector(fdi).with_context(|| format!("FDI at sector {}", fdi))?;
        Ok(raw.chunks_exact(2)
            .map(|w| u16::from_be_bytes([w[0], w[1]]) as usize)
            .take_while(|p| *p != 0)
            .take(MAX_FILES)
            .collect())
    }

    fn write_fdi(&mut self, fdi: usize, pointers: &[usize]) -> anyhow::Result<()> {
        let mut raw = vec![0; SECTOR_SIZE];
        for (i, p) in pointers.iter().take(MAX_FILES).enumerate() {
            raw[i * 2..i * 2 + 2].copy_from_slice(&(*p as u16).to_be_bytes());
        }
        self.image.write_sector(fdi, &raw)
    }

    fn read_fdr(&self, sector: usize) -> anyhow::Result<Fdr> {
        Fdr::from_repr(&self.image.read_sector(sector)?).with_context(|| format!("FDR at sector {}", sector))
    }

    fn write_fdr(&mut self, entry: &DirEntry) -> anyhow::Result<()> {
        self.image.write_sector(entry.sector, &entry.fdr.repr())
    }

    // An FDR we can safely follow: sane name and CHAIN, and every sector it names is on the disk.
    fn fdr_usable(&self, fdr: &Fdr) -> bool {
        let total = self.total_sectors();
        fdr.is_valid() && fdr.runs().all(|(first, c)| c.start as usize + c.run_end_count() - first <= total)
    }

    /// The files in a directory, in FDI order. Corrupt FDRs are skipped.
    pub fn files(&self, dir: &Directory) -> anyhow::Result<Vec<DirEntry>> {
        let mut files = vec![];
        for sector in self.read_fdi(dir.fdi)? {
            if sector >= self.total_sectors() {
                warn!("{}: FDI entry points past the end of the disk ({})", dir.fdi, sector);
                continue;
            }
            match self.read_fdr(sector) {
                Ok(fdr) if self.fdr_usable(&fdr) => files.push(DirEntry { fdi: dir.fdi, sector, fdr }),
                Ok(fdr) => warn!("Skipping invalid FDR in sector {}: {:#?}", sector, fdr),
                Err(e) => warn!("Skipping unreadable FDR in sector {}: {:#}", sector, e),
            }
        }
        Ok(files)
    }

    /// "NAME" is in the root directory, "DIR.NAME" is in a subdirectory.
    pub fn open_file(&self, path: &str) -> anyhow::Result<DirEntry> {
        let (dir, name) = self.split_path(path)?;
        self.files(&dir)?.into_iter()
            .find(|f| f.name() == name)
            .ok_or(DiskError::FileNotFound(path.to_owned()).into())
    }

    pub fn split_path(&self, path: &str) -> anyhow::Result<(Directory, String)> {
        match path.rsplit_once('.') {
            Some((dir, name)) => Ok((self.directory(dir)?, name.to_owned())),
            None => Ok((self.directory("")?, path.to_owned())),
        }
    }

    /// Opening files for record I/O is the job of the device service routine, not the disk layer.
    pub fn create_file(&mut self, _path: &str) -> anyhow::Result<DirEntry> {
        Err(DiskError::Unsupported("create_file").into())
    }

    /// Writes a whole file into `dir`. `fdr` supplies the name, type and record info; its CHAIN and size
    /// are replaced.
    pub fn add_file(&mut self, dir: &Directory, mut fdr: Fdr, data: &[u8]) -> anyhow::Result<DirEntry> {
        let name = fdr.name();
        if !fdr::is_valid_name(&fdr.name) {
            return Err(DiskError::InvalidName(name.clone()).into());
        }
        if self.files(dir)?.iter().any(|f| f.name() == name) {
            return Err(DiskError::FileExists(name.clone()).into());
        }
        if self.read_fdi(dir.fdi)?.len() >= MAX_FILES {
            return Err(DiskError::DirectoryFull.into());
        }
        let needed = (data.len() + SECTOR_SIZE - 1) / SECTOR_SIZE;
        let Some(sector) = self.find_free_sector(FIRST_FDR_SECTOR) else { return Err(DiskError::DiskFull.into()) };
        self.set_sector_allocation(sector, true);

        fdr.total_sectors = 0;
        fdr.chain = [fdr::Chain::default(); fdr::MAX_CHAIN];
        let mut entry = DirEntry { fdi: dir.fdi, sector, fdr };
        let granted = self.extend_file(&mut entry, needed)?;
        if granted < needed {
            let free = self.free_sectors() + granted;
            for s in entry.fdr.truncate(0) {
                self.set_sector_allocation(s, false);
            }
            self.set_sector_allocation(sector, false);
            self.write_vib()?;
            return Err(if free >= needed { DiskError::TooFragmented } else { DiskError::DiskFull }.into());
        }
        for (i, chunk) in data.chunks(SECTOR_SIZE).enumerate() {
            self.write_file_sector(&mut entry, i, chunk)?;
        }
        if entry.fdr.is_program() || entry.fdr.is_variable() {
            entry.fdr.eof_offset = (data.len() % SECTOR_SIZE) as u8;
        }
        self.write_fdr(&entry)?;
        self.add_file_descriptor(dir, sector)?;
        self.write_vib()?;
        debug!("Added {} ({} sectors) at FDR {}", name, needed, sector);
        Ok(entry)
    }

    pub fn delete_file(&mut self, path: &str) -> anyhow::Result<()> {
        let mut entry = self.open_file(path)?;
        for s in entry.fdr.truncate(0) {
            self.set_sector_allocation(s, false);
        }
        self.set_sector_allocation(entry.sector, false);
        let fdi: Vec<usize> = self.read_fdi(entry.fdi)?.into_iter().filter(|s| *s != entry.sector).collect();
        self.write_fdi(entry.fdi, &fdi)?;
        self.write_vib()?;
        debug!("Deleted {} (FDR {})", path, entry.sector);
        Ok(())
    }

    pub fn get_file_sector(&self, entry: &DirEntry, index: usize) -> Option<usize> {
        entry.fdr.get_sector(index)
    }

    pub fn read_file_sector(&self, entry: &DirEntry, index: usize) -> anyhow::Result<Vec<u8>> {
        let sector = self.get_file_sector(entry, index)
            .ok_or(anyhow::anyhow!("{}: sector {} is past the end of the file", entry.name(), index))?;
        self.image.read_sector(sector)
    }

    /// Writes file sector `index`, growing the file if `index` is just past its end.
    pub fn write_file_sector(&mut self, entry: &mut DirEntry, index: usize, data: &[u8]) -> anyhow::Result<()> {
        let have = entry.fdr.total_sectors as usize;
        if index >= have {
            let wanted = index + 1 - have;
            if self.extend_file(entry, wanted)? < wanted {
                return Err(DiskError::DiskFull.into());
            }
        }
        let sector = self.get_file_sector(entry, index)
            .ok_or(anyhow::anyhow!("{}: no sector {}", entry.name(), index))?;
        let mut buf = data.to_vec();
        buf.resize(SECTOR_SIZE, 0);
        self.image.write_sector(sector, &buf)
    }

    /// The file's data, trimmed to its end of file where the type records one.
    pub fn read_file(&self, entry: &DirEntry) -> anyhow::Result<Vec<u8>> {
        let mut data = Vec::with_capacity(entry.fdr.total_sectors as usize * SECTOR_SIZE);
        for sector in entry.fdr.sectors() {
            data.extend(self.image.read_sector(sector)?);
        }
        data.truncate(entry.fdr.len());
        Ok(data)
    }

    /// Adds up to `count` sectors to the end of the file and returns how many it got. Each new sector is
    /// looked for after the file's last sector, then from the first data sector, then anywhere.
    pub fn extend_file(&mut self, entry: &mut DirEntry, count: usize) -> anyhow::Result<usize> {
        let mut granted = 0;
        while granted < count {
            let last = entry.fdr.sectors().last();
            let hints = [last.map(|s| s + 1), Some(FIRST_DATA_SECTOR), Some(0)];
            let Some(sector) = hints.into_iter().flatten().find_map(|h| self.find_free_sector(h)) else { break };
            if !self.add_file_sector(entry, sector) {
                break;
            }
            self.set_sector_allocation(sector, true);
            granted += 1;
        }
        if granted > 0 {
            self.write_fdr(entry)?;
            self.write_vib()?;
        }
        Ok(granted)
    }

    /// Shortens a file to `sectors` sectors, freeing the rest.
    pub fn truncate_file(&mut self, entry: &mut DirEntry, sectors: usize) -> anyhow::Result<()> {
        let freed = entry.fdr.truncate(sectors);
        if freed.is_empty() {
            return Ok(());
        }
        for s in freed {
            self.set_sector_allocation(s, false);
        }
        if sectors == 0 {
            entry.fdr.eof_offset = 0;
        }
        self.write_fdr(entry)?;
        self.write_vib()
    }

    /// First free sector at or after `hint`, scanning the bitmap a byte at a time.
    pub fn find_free_sector(&self, hint: usize) -> Option<usize> {
        let total = self.total_sectors();
        let bitmap = &self.vib.bitmap;
        for byte in hint / 8..bitmap.len() {
            if bitmap[byte] == 0xFF {
                continue;
            }
            let first_bit = if byte == hint / 8 { hint % 8 } else { 0 };
            for bit in first_bit..8 {
                let sector = byte * 8 + bit;
                if sector >= total {
                    return None;
                }
                if bitmap[byte] & 1 << bit == 0 {
                    return Some(sector);
                }
            }
        }
        None
    }

    pub fn set_sector_allocation(&mut self, sector: usize, allocated: bool) {
        self.vib.set_allocated(sector, allocated);
    }

    /// Appends one sector to the file's CHAIN. False if the CHAIN is full and `sector` isn't contiguous.
    pub fn add_file_sector(&mut self, entry: &mut DirEntry, sector: usize) -> bool {
        entry.fdr.add_sector(sector)
    }

    // Index 0 may hold a hidden entry that stays put when the FDI is sorted: one that isn't a usable file, or
    // that sorts after the entry behind it.
    fn fdi_sentinel(&self, fdi: &[usize]) -> bool {
        let name = |i: usize| fdi.get(i)
            .filter(|s| **s < self.total_sectors())
            .and_then(|s| self.read_fdr(*s).ok())
            .filter(|f| self.fdr_usable(f))
            .map(|f| f.name);
        match (fdi.is_empty(), name(0), name(1)) {
            (true, _, _) => false,
            (false, None, _) => true,
            (false, Some(first), Some(second)) => first > second,
            (false, Some(_), None) => false,
        }
    }

    /// Inserts an FDR pointer into a directory's FDI, keeping it sorted by file name.
    pub fn add_file_descriptor(&mut self, dir: &Directory, fdr_sector: usize) -> anyhow::Result<()> {
        let mut fdi = self.read_fdi(dir.fdi)?;
        if fdi.len() >= MAX_FILES {
            return Err(DiskError::DirectoryFull.into());
        }
        let name = self.read_fdr(fdr_sector)?.name;
        let skip = self.fdi_sentinel(&fdi) as usize;
        let mut at = fdi.len();
        for (i, s) in fdi.iter().enumerate().skip(skip) {
            match self.read_fdr(*s) {
                Ok(other) if other.name > name => { at = i; break },
                _ => {},
            }
        }
        fdi.insert(at, fdr_sector);
        self.write_fdi(dir.fdi, &fdi)
    }

    /// Cross checks every directory's files against the bitmap.
    pub fn check_disk(&self) -> anyhow::Result<CheckReport> {
        let total = self.total_sectors();
        let mut owners: Vec<Vec<String>> = vec![vec![]; total];
        let mut own = |sector: usize, owner: String| {
            if let Some(o) = owners.get_mut(sector) { o.push(owner) }
        };
        own(VIB_SECTOR, "VIB".to_owned());
        for dir in self.directories() {
            own(dir.fdi, format!("FDI {}", dir.name));
            for f in self.files(&dir)? {
                let name = if dir.name.is_empty() { f.name() } else { format!("{}.{}", dir.name, f.name()) };
                own(f.sector, format!("{} (FDR)", name));
                for s in f.fdr.sectors() {
                    own(s, name.clone());
                }
            }
        }

        let mut report = CheckReport::default();
        for (sector, o) in owners.iter().enumerate() {
            let allocated = self.vib.is_allocated(sector);
            if o.len() > 1 {
                warn!("Sector {} is cross linked: {}", sector, o.join(", "));
                report.cross_linked.push(sector);
            }
            if !o.is_empty() && !allocated {
                warn!("Sector {} is used by {} but marked free", sector, o[0]);
                report.unallocated_in_use.push(sector);
            }
            if o.is_empty() && allocated {
                warn!("Sector {} is marked allocated but nothing uses it", sector);
                report.allocated_unused.push(sector);
            }
        }
        Ok(report)
    }

    /// Tells the device the filesystem changed. Writes are already through, so this just flushes.
    pub fn disk_modified(&mut self) -> anyhow::Result<()> {
        self.image.flush()
    }

    pub fn free_sectors(&self) -> usize {
        (0..self.total_sectors()).filter(|s| !self.vib.is_allocated(*s)).count()
    }

    pub fn used_sectors(&self) -> usize {
        self.total_sectors() - self.free_sectors()
    }
}

impl<B: SectorDevice> Debug for DiskFs<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            write!(f, "TI Disk FS\nImage: sectors={}\n{:#?}\n", self.image.sectors(), self.vib)?;
            for dir in self.directories() {
                write!(f, "Directory {:?} (FDI @ {}):\n", dir.name, dir.fdi)?;
                match self.files(&dir) {
                    Ok(files) => for e in files { write!(f, "  {:5} {:#?}\n", e.sector, e.fdr)? },
                    Err(e) => write!(f, "  Unreadable: {:#}\n", e)?,
                }
            }
            Ok(())
        } else {
            f.debug_struct("DiskFs")
                .field("vib", &self.vib)
                .finish()
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use super::fdr::{Chain, INTERNAL, MAX_CHAIN, PROGRAM, VARIABLE};
    use crate::block::{SSSD_GEOMETRY, DSDD_GEOMETRY};
    use crate::block::logical::Logical;
    use crate::block::DiskMedia;

    use chrono::TimeZone;
    use pretty_hex::PrettyHex;

    /// Stands in for chrono::Local so timestamps are predictable.
    pub struct Local;
    impl Local {
        pub fn now() -> chrono::DateTime<chrono::Local> {
            chrono::Local.from_local_datetime(&chrono::NaiveDate::from_ymd_opt(1984, 6, 1).unwrap().and_hms_opt(12, 34, 56).unwrap())
                .earliest().unwrap()
        }
    }

    #[derive(Clone, Debug)]
    pub struct TestDev(pub Vec<u8>);

    impl SectorDevice for TestDev {
        fn read_sector(&self, sector: usize) -> anyhow::Result<Vec<u8>> {
            self.0.get(sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE)
                .map(|s| s.to_vec())
                .ok_or(anyhow::anyhow!("Sector {} out of range", sector))
        }
        fn write_sector(&mut self, sector: usize, buf: &[u8]) -> anyhow::Result<()> {
            let dest = self.0.get_mut(sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE)
                .ok_or(anyhow::anyhow!("Sector {} out of range", sector))?;
            dest[..buf.len()].copy_from_slice(buf);
            Ok(())
        }
        fn sectors(&self) -> usize {
            self.0.len() / SECTOR_SIZE
        }
    }

    pub fn incrementing(count: usize) -> Vec<u8> {
        (0..count).map(|x| x as u8).collect()
    }

    pub fn fresh_disk() -> DiskFs<TestDev> {
        DiskFs::format(TestDev(vec![0; SSSD_GEOMETRY.total_sectors() * SECTOR_SIZE]), "TEST", &SSSD_GEOMETRY)
            .expect("format")
    }

    #[macro_export]
    macro_rules! assert_sector_eq {
        ($image:expr, $sector:expr, $($expected:expr),+) => {
            {
                let got = $image.read_sector($sector).expect("read_sector");
                let mut expected: Vec<u8> = vec![];
                $( expected.extend($expected); )+
                if got != expected {
                    panic!("Sector {} mismatch.\nExpected:\n{:?}\nGot:\n{:?}", $sector, expected.hex_dump(), got.hex_dump());
                }
            }
        };
    }

    fn root() -> Directory {
        Directory { name: "".to_owned(), fdi: ROOT_FDI }
    }

    #[test]
    fn test_format() {
        let fs = fresh_disk();
        assert_sector_eq!(fs.image, 1, vec![0; SECTOR_SIZE]);
        assert_eq!(358, fs.free_sectors());
        assert_eq!(2, fs.used_sectors());
        assert_eq!(vec![root()], fs.directories());
        assert!(fs.check_disk().unwrap().is_clean());
        assert!(DiskFs::image_is(&fs.image));
        assert!(!DiskFs::image_is(&TestDev(vec![0; 10 * SECTOR_SIZE])));
    }

    #[test]
    fn test_extend_contiguous() {
        let mut fs = fresh_disk();
        let mut f = DirEntry { fdi: ROOT_FDI, sector: 2, fdr: Fdr::new("F", 0, 80).unwrap() };
        fs.set_sector_allocation(2, true);
        assert_eq!(3, fs.extend_file(&mut f, 3).unwrap());
        assert_eq!(Some(1), f.fdr.chain_len());
        assert_eq!(Chain { start: 34, end_offset: 2 }, f.fdr.chain[0]);
        assert_eq!(3, f.fdr.total_sectors);
        assert!(fs.vib.is_allocated(34) && fs.vib.is_allocated(35) && fs.vib.is_allocated(36));
        assert!(!fs.vib.is_allocated(37));
        // The FDR went to disk too.
        assert_sector_eq!(fs.image, 2, f.fdr.repr());
    }

    #[test]
    fn test_extend_wraps_to_start() {
        let mut fs = fresh_disk();
        for s in 34..360 {
            fs.set_sector_allocation(s, true);
        }
        let mut f = DirEntry { fdi: ROOT_FDI, sector: 2, fdr: Fdr::new("F", 0, 80).unwrap() };
        fs.set_sector_allocation(2, true);
        assert_eq!(31, fs.extend_file(&mut f, 40).unwrap());
        assert_eq!(Some(3), f.fdr.get_sector(0));
        assert_eq!(Some(33), f.fdr.get_sector(30));
        assert_eq!(0, fs.free_sectors());
    }

    #[test]
    fn test_too_fragmented() {
        let mut fs = fresh_disk();
        // Every other sector taken, so each new sector starts a new run.
        for s in (35..360).step_by(2) {
            fs.set_sector_allocation(s, true);
        }
        let mut f = DirEntry { fdi: ROOT_FDI, sector: 2, fdr: Fdr::new("F", 0, 80).unwrap() };
        fs.set_sector_allocation(2, true);
        assert_eq!(MAX_CHAIN, fs.extend_file(&mut f, MAX_CHAIN + 1).unwrap());
        assert_eq!(Some(MAX_CHAIN), f.fdr.chain_len());

        let bitmap = fs.vib.bitmap;
        let next = fs.find_free_sector(f.fdr.sectors().last().unwrap() + 1).unwrap();
        assert!(!fs.add_file_sector(&mut f, next));
        assert_eq!(bitmap, fs.vib.bitmap);
        assert_eq!(0, fs.extend_file(&mut f, 1).unwrap());
        assert_eq!(bitmap, fs.vib.bitmap);
    }

    #[test]
    fn test_find_free_sector() {
        let mut fs = fresh_disk();
        assert_eq!(Some(2), fs.find_free_sector(0));
        assert_eq!(Some(34), fs.find_free_sector(34));
        fs.set_sector_allocation(34, true);
        assert_eq!(Some(35), fs.find_free_sector(34));
        assert_eq!(Some(359), fs.find_free_sector(359));
        assert_eq!(None, fs.find_free_sector(360));
        fs.set_sector_allocation(359, true);
        assert_eq!(None, fs.find_free_sector(359));
    }

    #[test]
    fn test_add_read_delete() {
        let mut fs = fresh_disk();
        let data = incrementing(1000);
        let f = fs.add_file(&root(), Fdr::new("HELLO", PROGRAM, 0).unwrap(), &data).expect("add_file");
        assert_eq!(2, f.sector);
        assert_eq!(4, f.fdr.total_sectors);
        assert_eq!(1000 % 256, f.fdr.eof_offset as usize);
        assert_sector_eq!(fs.image, 1, vec![0x00, 0x02], vec![0; SECTOR_SIZE - 2]);
        assert_sector_eq!(fs.image, 34, incrementing(256));
        assert_sector_eq!(fs.image, 37, data[768..].to_vec(), vec![0; 1024 - 1000]);

        let opened = fs.open_file("HELLO").unwrap();
        assert_eq!(f, opened);
        assert_eq!(data, fs.read_file(&opened).unwrap());
        assert!(fs.check_disk().unwrap().is_clean());

        let e = fs.add_file(&root(), Fdr::new("HELLO", PROGRAM, 0).unwrap(), &data).unwrap_err();
        assert_eq!(Some(&DiskError::FileExists("HELLO".to_owned())), e.downcast_ref::<DiskError>());

        fs.delete_file("HELLO").unwrap();
        assert_eq!(358, fs.free_sectors());
        assert_sector_eq!(fs.image, 1, vec![0; SECTOR_SIZE]);
        assert!(fs.check_disk().unwrap().is_clean());
        let e = fs.open_file("HELLO").unwrap_err();
        assert_eq!(Some(&DiskError::FileNotFound("HELLO".to_owned())), e.downcast_ref::<DiskError>());
    }

    #[test]
    fn test_fdi_sorted() {
        let mut fs = fresh_disk();
        for name in ["MIDDLE", "ZED", "ALPHA", "BETA"] {
            fs.add_file(&root(), Fdr::new(name, 0, 80).unwrap(), &incrementing(10)).unwrap();
        }
        let names: Vec<String> = fs.files(&root()).unwrap().iter().map(|f| f.name()).collect();
        assert_eq!(vec!["ALPHA", "BETA", "MIDDLE", "ZED"], names);
        fs.delete_file("BETA").unwrap();
        let fdi = fs.read_fdi(ROOT_FDI).unwrap();
        assert_eq!(3, fdi.len());
        assert_sector_eq!(fs.image, 1, vec![0x00, 0x04, 0x00, 0x02, 0x00, 0x03], vec![0; SECTOR_SIZE - 6]);
        assert!(fs.check_disk().unwrap().is_clean());
    }

    #[test]
    fn test_disk_full_rolls_back() {
        let mut fs = fresh_disk();
        let before = fs.vib.clone();
        let e = fs.add_file(&root(), Fdr::new("HUGE", 0, 128).unwrap(), &vec![0; 400 * SECTOR_SIZE]).unwrap_err();
        assert_eq!(Some(&DiskError::DiskFull), e.downcast_ref::<DiskError>());
        assert_eq!(before, fs.vib);
        assert_eq!(Vec::<usize>::new(), fs.read_fdi(ROOT_FDI).unwrap());
        assert!(fs.check_disk().unwrap().is_clean());
    }

    #[test]
    fn test_add_file_too_fragmented() {
        let mut fs = fresh_disk();
        for s in (35..360).step_by(2) {
            fs.set_sector_allocation(s, true);
        }
        let e = fs.add_file(&root(), Fdr::new("FRAG", 0, 128).unwrap(), &vec![0; 100 * SECTOR_SIZE]).unwrap_err();
        assert_eq!(Some(&DiskError::TooFragmented), e.downcast_ref::<DiskError>());
    }

    #[test]
    fn test_write_and_truncate() {
        let mut fs = fresh_disk();
        let mut f = fs.add_file(&root(), Fdr::new("LOG", VARIABLE, 80).unwrap(), &[]).unwrap();
        assert_eq!(0, f.fdr.total_sectors);
        for i in 0..5 {
            fs.write_file_sector(&mut f, i, &[i as u8 + 1; SECTOR_SIZE]).unwrap();
        }
        assert_eq!(5, f.fdr.total_sectors);
        assert_eq!(vec![3; SECTOR_SIZE], fs.read_file_sector(&f, 2).unwrap());
        assert_eq!(Some(36), fs.get_file_sector(&f, 2));
        assert!(fs.read_file_sector(&f, 5).is_err());
        assert!(fs.check_disk().unwrap().is_clean());

        fs.truncate_file(&mut f, 2).unwrap();
        assert_eq!(2, f.fdr.total_sectors);
        assert!(!fs.vib.is_allocated(36));
        assert_eq!(f, fs.open_file("LOG").unwrap());
        assert!(fs.check_disk().unwrap().is_clean());
    }

    #[test]
    fn test_check_disk_finds_problems() {
        let mut fs = fresh_disk();
        let a = fs.add_file(&root(), Fdr::new("A", 0, 80).unwrap(), &incrementing(512)).unwrap();
        let mut b = fs.add_file(&root(), Fdr::new("B", 0, 80).unwrap(), &incrementing(256)).unwrap();
        // Point B at A's second sector.
        b.fdr.chain[0].start = a.fdr.get_sector(1).unwrap() as u16;
        fs.image.write_sector(b.sector, &b.fdr.repr()).unwrap();
        fs.set_sector_allocation(100, true);
        fs.set_sector_allocation(3, false); // B's FDR
        let report = fs.check_disk().unwrap();
        assert_eq!(vec![35], report.cross_linked);
        assert_eq!(vec![3], report.unallocated_in_use);
        assert_eq!(vec![36, 100], report.allocated_unused);
    }

    #[test]
    fn test_skips_corrupt_fdr() {
        let mut fs = fresh_disk();
        fs.add_file(&root(), Fdr::new("GOOD", 0, 80).unwrap(), &incrementing(10)).unwrap();
        let bad = fs.add_file(&root(), Fdr::new("BAD", 0, 80).unwrap(), &incrementing(10)).unwrap();
        let mut raw = bad.fdr.repr();
        raw[0x0F] = 9; // total sectors no longer matches the CHAIN
        fs.image.write_sector(bad.sector, &raw).unwrap();
        let names = |fs: &DiskFs<TestDev>| fs.files(&root()).unwrap().iter().map(|f| f.name()).collect::<Vec<String>>();
        assert_eq!(vec!["GOOD"], names(&fs));

        let corrupt: [(&str, fn(&mut Fdr)); 5] = [
            ("PROGINT",  |f: &mut Fdr| f.flags = PROGRAM | INTERNAL),
            ("PROGVAR",  |f: &mut Fdr| f.flags = PROGRAM | INTERNAL | VARIABLE),
            ("PROGRECS", |f: &mut Fdr| { f.flags = PROGRAM; f.records_per_sector = 5 }),
            ("BIGRECS",  |f: &mut Fdr| { f.records_per_sector = 9; f.record_length = 200 }),
            ("VARCOUNT", |f: &mut Fdr| { f.flags = VARIABLE; f.fixed_records = f.total_sectors + 1 }),
        ];
        for (name, spoil) in corrupt {
            let mut f = fs.add_file(&root(), Fdr::new(name, 0, 80).unwrap(), &incrementing(10)).unwrap();
            assert!(names(&fs).contains(&name.to_owned()));
            spoil(&mut f.fdr);
            fs.image.write_sector(f.sector, &f.fdr.repr()).unwrap();
            assert!(!names(&fs).contains(&name.to_owned()), "{} still listed", name);
            assert!(fs.open_file(name).is_err());
        }
        assert_eq!(vec!["GOOD"], names(&fs));
    }

    #[test]
    fn test_fdi_keeps_sentinel_first() {
        let mut fs = fresh_disk();
        for name in ["MIDDLE", "ZED"] {
            fs.add_file(&root(), Fdr::new(name, 0, 80).unwrap(), &incrementing(10)).unwrap();
        }
        // A hidden entry that sorts last, parked in front of the real files.
        let hidden = fs.add_file(&root(), Fdr::new("ZZHIDDEN", 0, 80).unwrap(), &incrementing(10)).unwrap();
        let mut fdi = fs.read_fdi(ROOT_FDI).unwrap();
        fdi.retain(|s| *s != hidden.sector);
        fdi.insert(0, hidden.sector);
        fs.write_fdi(ROOT_FDI, &fdi).unwrap();

        fs.add_file(&root(), Fdr::new("ALPHA", 0, 80).unwrap(), &incrementing(10)).unwrap();
        fs.add_file(&root(), Fdr::new("ZOO", 0, 80).unwrap(), &incrementing(10)).unwrap();
        let names: Vec<String> = fs.files(&root()).unwrap().iter().map(|f| f.name()).collect();
        assert_eq!(vec!["ZZHIDDEN", "ALPHA", "MIDDLE", "ZED", "ZOO"], names);

        // An entry that isn't a file at all stays in front too.
        let mut raw = hidden.fdr.repr();
        raw[..10].copy_from_slice(&[0xFF; 10]);
        fs.image.write_sector(hidden.sector, &raw).unwrap();
        fs.add_file(&root(), Fdr::new("AARDVARK", 0, 80).unwrap(), &incrementing(10)).unwrap();
        assert_eq!(hidden.sector, fs.read_fdi(ROOT_FDI).unwrap()[0]);
        let names: Vec<String> = fs.files(&root()).unwrap().iter().map(|f| f.name()).collect();
        assert_eq!(vec!["AARDVARK", "ALPHA", "MIDDLE", "ZED", "ZOO"], names);
    }

    #[test]
    fn test_subdirectory() {
        let mut fs = fresh_disk();
        fs.set_sector_allocation(20, true);
        fs.vib.subdirs[0] = vib::Subdir { name: *b"GAMES     ", fdi: 20 };
        fs.image.write_sector(20, &[0; SECTOR_SIZE]).unwrap();
        let games = fs.directory("GAMES").unwrap();
        fs.add_file(&games, Fdr::new("PONG", PROGRAM, 0).unwrap(), &incrementing(300)).unwrap();
        assert_eq!(incrementing(300), fs.read_file(&fs.open_file("GAMES.PONG").unwrap()).unwrap());
        assert!(fs.open_file("PONG").is_err());
        assert!(fs.check_disk().unwrap().is_clean());
    }

    #[test]
    fn test_create_file_unsupported() {
        let mut fs = fresh_disk();
        let e = fs.create_file("NEW").unwrap_err();
        assert_eq!(Some(&DiskError::Unsupported("create_file")), e.downcast_ref::<DiskError>());
    }

    #[test]
    fn test_disk_modified_is_idempotent() {
        let mut fs = fresh_disk();
        fs.add_file(&root(), Fdr::new("X", 0, 80).unwrap(), &incrementing(10)).unwrap();
        fs.disk_modified().expect("first");
        fs.disk_modified().expect("second");
    }

    #[test]
    fn test_on_media() {
        let media = DiskMedia::formatted(DSDD_GEOMETRY).shared();
        let mut fs = DiskFs::format(Logical::with_geometry(media.clone(), DSDD_GEOMETRY), "MEDIA", &DSDD_GEOMETRY).unwrap();
        fs.add_file(&root(), Fdr::new("BIG", 0, 128).unwrap(), &vec![0x77; 1000 * SECTOR_SIZE]).unwrap();
        fs.disk_modified().unwrap();
        assert!(media.borrow().has_changed());

        let fs = DiskFs::open(Logical::new(media.clone())).unwrap();
        assert_eq!(DSDD_GEOMETRY, fs.image.geometry);
        let f = fs.open_file("BIG").unwrap();
        assert_eq!(1000, f.fdr.total_sectors);
        // Logical sector 1000 is on side 1, counting down from the last track.
        assert_eq!(Some(1000), f.fdr.get_sector(1000 - 34));
        assert_eq!(&[0x77; SECTOR_SIZE][..], media.borrow().read_sector(39 - (1000 - 720) / 18, 1, ((1000 - 720) % 18) as u8, (39 - (1000 - 720) / 18) as u8).unwrap());
        assert!(fs.check_disk().unwrap().is_clean());
    }
}
