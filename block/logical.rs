// Copyright © 2023 David Caldwell <david@porkrind.org>

use anyhow::anyhow;

use super::{Geometry, SectorDevice, SharedMedia, SECTOR_SIZE};
use crate::error::DiskError;

/// TI logical sector numbering on top of shared media. This is what the filesystem sits on.
#[derive(Clone, Debug)]
pub struct Logical {
    pub media: SharedMedia,
    pub geometry: Geometry,
}

impl Logical {
    pub fn new(media: SharedMedia) -> Logical {
        let geometry = media.borrow().logical_geometry();
        Logical { media, geometry }
    }

    pub fn with_geometry(media: SharedMedia, geometry: Geometry) -> Logical {
        Logical { media, geometry }
    }
}

impl SectorDevice for Logical {
    fn read_sector(&self, sector: usize) -> anyhow::Result<Vec<u8>> {
        self.media.borrow()
            .read_logical_sector(&self.geometry, sector)
            .map(|s| s.to_vec())
            .ok_or(anyhow!("Sector {} not found", sector))
    }

    fn write_sector(&mut self, sector: usize, buf: &[u8]) -> anyhow::Result<()> {
        let mut media = self.media.borrow_mut();
        if media.is_write_protected() {
            return Err(DiskError::WriteProtected.into());
        }
        let mut padded = buf.to_vec();
        padded.resize(SECTOR_SIZE, 0);
        match media.write_logical_sector(&self.geometry, sector, &padded) {
            true => Ok(()),
            false => Err(anyhow!("Sector {} not found", sector)),
        }
    }

    fn sectors(&self) -> usize {
        self.geometry.total_sectors()
    }

    // In-memory media has nowhere to go; its changes stay pending.
    fn flush(&mut self) -> anyhow::Result<()> {
        let mut media = self.media.borrow_mut();
        if media.path().is_none() {
            return Ok(());
        }
        media.save()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::test::{numbered_media, temp_path};
    use crate::block::{DiskMedia, ImageFormat, DSSD_GEOMETRY, SSSD_GEOMETRY};

    #[test]
    fn test_geometry_from_vib() {
        let dev = Logical::new(numbered_media(DSSD_GEOMETRY).shared());
        assert_eq!(DSSD_GEOMETRY, dev.geometry);
        assert_eq!(720, dev.sectors());
        assert_eq!(vec![100; SECTOR_SIZE], dev.read_sector(100).unwrap());
        assert_eq!(vec![(500 % 256) as u8; SECTOR_SIZE], dev.read_sector(500).unwrap());
        assert!(dev.read_sector(720).is_err());
    }

    #[test]
    fn test_write_protected() {
        let media = numbered_media(SSSD_GEOMETRY).shared();
        media.borrow_mut().set_write_protected(true);
        let mut dev = Logical::new(media.clone());
        let e = dev.write_sector(3, &[0; SECTOR_SIZE]).unwrap_err();
        assert_eq!(Some(&DiskError::WriteProtected), e.downcast_ref::<DiskError>());
        assert_eq!(vec![3; SECTOR_SIZE], dev.read_sector(3).unwrap());
    }

    #[test]
    fn test_flush_saves() {
        let path = temp_path("logical-flush.dsk");
        std::fs::write(&path, numbered_media(SSSD_GEOMETRY).to_bytes(ImageFormat::V9t9).unwrap()).unwrap();
        let media = DiskMedia::open(&path).shared();
        let mut dev = Logical::new(media.clone());
        dev.write_sector(42, b"short").unwrap();
        assert!(media.borrow().has_changed());
        dev.flush().unwrap();
        assert!(!media.borrow().has_changed());
        dev.flush().unwrap();
        let image = std::fs::read(&path).unwrap();
        assert_eq!(b"short\0\0", &image[42 * SECTOR_SIZE..42 * SECTOR_SIZE + 7]);
        std::fs::remove_file(&path).unwrap();
    }
}
