// Copyright © 2023 David Caldwell <david@porkrind.org>

// Various operations we can do on TI disk images

use crate::block::logical::Logical;
use crate::block::{split_volume, DiskMedia, Geometry, ImageFormat, SectorDevice, SharedMedia, SECTOR_SIZE,
                   DSDD_GEOMETRY, DSSD_GEOMETRY, SSDD_GEOMETRY, SSSD_GEOMETRY};
use crate::fs::fdr::{Fdr, PROGRAM};
use crate::fs::vib::Vib;
use crate::fs::{DiskFs, VIB_SECTOR};

use std::path::{PathBuf, Path};

use anyhow::{anyhow, Context};
use log::info;
use pretty_hex::PrettyHex;
use serde::Deserialize;

pub type TiFs = DiskFs<Logical>;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, strum::EnumVariantNames)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DiskType {
    SSSD,
    DSSD,
    SSDD,
    DSDD,
}

impl DiskType {
    pub fn geometry(&self) -> Geometry {
        match self {
            DiskType::SSSD => SSSD_GEOMETRY,
            DiskType::DSSD => DSSD_GEOMETRY,
            DiskType::SSDD => SSDD_GEOMETRY,
            DiskType::DSDD => DSDD_GEOMETRY,
        }
    }
}

pub fn image_format_from_ext(path: &Path) -> anyhow::Result<ImageFormat> {
    let (file, _) = split_volume(path);
    let ext = file.extension().and_then(|oss| oss.to_str()).map(|e| e.to_lowercase());
    match ext.as_deref() {
        Some("dsk") | Some("v9t9")         => Ok(ImageFormat::V9t9),
        Some("pc99") | Some("trk")         => Ok(ImageFormat::Pc99),
        Some("ana") | Some("anadisk")      => Ok(ImageFormat::AnaDisk),
        Some("cf7") | Some("img")          => Ok(ImageFormat::Cf7),
        Some(ext) => Err(anyhow!("Unknown image type {}", ext)),
        None      => Err(anyhow!("Unknown image type for {}", path.to_string_lossy())),
    }
}

pub fn open_media(path: &Path) -> anyhow::Result<SharedMedia> {
    let (file, _) = split_volume(path);
    std::fs::metadata(&file).with_context(|| format!("{}", file.to_string_lossy()))?;
    let media = DiskMedia::open(path);
    if media.format() == ImageFormat::Unknown {
        return Err(anyhow!("{}: not a disk image I understand", path.to_string_lossy()));
    }
    Ok(media.shared())
}

pub fn open_fs(media: &SharedMedia) -> anyhow::Result<TiFs> {
    DiskFs::open(Logical::new(media.clone()))
}

pub fn ls(fs: &TiFs, long: bool) -> anyhow::Result<()> {
    println!("Volume {}", fs.vib.name());
    for dir in fs.directories() {
        if !dir.name.is_empty() {
            println!("\n{}:", dir.name);
        }
        for f in fs.files(&dir)? {
            match long {
                false => println!("{:?}", f.fdr),
                true  => println!("{:#?}", f.fdr),
            }
        }
    }
    let free_sectors = fs.free_sectors();
    let used_sectors = fs.used_sectors();
    let total = (used_sectors + free_sectors).max(1);
    println!("\nUsed  {:4} sectors {:7} bytes {:3}%\nFree  {:4} sectors {:7} bytes {:3}%\nTotal {:4} sectors {:7} bytes",
             used_sectors, used_sectors * SECTOR_SIZE, used_sectors * 100 / total,
             free_sectors, free_sectors * SECTOR_SIZE, free_sectors * 100 / total,
             used_sectors + free_sectors, (used_sectors + free_sectors) * SECTOR_SIZE);
    Ok(())
}

pub fn cp_from_image(fs: &TiFs, src: &Path, dest: &Path) -> anyhow::Result<()> {
    let local_dest = match (dest.exists(), std::fs::metadata(&dest)) {
        (true, Ok(m)) if m.is_dir() => dest.join(src.file_name().ok_or(anyhow!("Bad filename: {}", src.to_string_lossy()))?),
        (true, Err(e)) => Err(e).with_context(|| format!("{}", dest.to_string_lossy()))?,
        (_, _) => dest.to_owned(),
    };
    let source_file = path_to_ti_filename(src)?;
    let file = fs.open_file(&source_file)?;
    print!("{} -> {}", source_file, local_dest.to_string_lossy());
    let data = fs.read_file(&file)?;
    std::fs::write(&local_dest, &data).with_context(|| format!("{}", local_dest.to_string_lossy()))?;
    print!("... Successfully copied {} sectors ({} bytes)\n", file.fdr.total_sectors, data.len());
    Ok(())
}

// Host files go in as PROGRAM images; that's the only type whose length is exact to the byte.
pub fn cp_into_image(fs: &mut TiFs, src: &Path, dest: &Path) -> anyhow::Result<()> {
    let dest = match dest {
        d if d == Path::new(".") => Path::new(src.file_name().ok_or_else(|| anyhow!("Need source filename to use '.'"))?),
        d => d,
    };
    let (dir, name) = fs.split_path(&path_to_ti_filename(dest)?)?;
    let buf = std::fs::read(src).with_context(|| format!("{}", src.to_string_lossy()))?;
    let entry = fs.add_file(&dir, Fdr::new(&name, PROGRAM, 0)?, &buf)?;
    info!("Copied {} into {} ({} sectors)", src.to_string_lossy(), entry.name(), entry.fdr.total_sectors);
    Ok(())
}

pub fn rm(fs: &mut TiFs, file: &Path) -> anyhow::Result<()> {
    fs.delete_file(&path_to_ti_filename(file)?)
}

pub fn cat(fs: &TiFs, file: &Path) -> anyhow::Result<Vec<u8>> {
    fs.read_file(&fs.open_file(&path_to_ti_filename(file)?)?)
}

/// Backs the old image up to `.bak` and writes the new one in its place.
pub fn save_image(media: &SharedMedia, filename: &Path, format: ImageFormat) -> anyhow::Result<()> {
    let (file, volume) = split_volume(filename);
    if file.exists() {
        let bakname = file.append(".bak");
        std::fs::copy(&file, &bakname).with_context(|| format!("{}", bakname.to_string_lossy()))?;
    }
    let mut media = media.borrow_mut();
    if volume.is_some() {
        media.set_volume(volume);
    }
    media.save_as(&file, format)
}

pub fn dump(media: &SharedMedia, by_sector: bool) -> anyhow::Result<()> {
    if by_sector {
        let image = Logical::new(media.clone());
        for s in 0..image.sectors() {
            println!("Sector {}\n{:?}", s, image.read_sector(s)?.hex_dump());
        }
    } else {
        let media = media.borrow();
        for side in 0..media.num_sides() {
            for (t, track) in media.tracks(side).iter().enumerate() {
                println!("Track {} side {}: {:?}\n{:?}", t, side, track, track.data.hex_dump());
            }
        }
    }
    Ok(())
}

pub fn dump_file(fs: &TiFs, file: &Path) -> anyhow::Result<()> {
    let entry = fs.open_file(&path_to_ti_filename(file)?)?;
    println!("{:#?}", entry.fdr);
    for (i, sector) in entry.fdr.sectors().enumerate() {
        println!("File sector {} (disk sector {})\n{:?}", i, sector, fs.read_file_sector(&entry, i)?.hex_dump());
    }
    Ok(())
}

pub fn dump_vib(media: &SharedMedia) -> anyhow::Result<()> {
    let image = Logical::new(media.clone());
    let vib = Vib::from_repr(&image.read_sector(VIB_SECTOR)?)?;
    println!("{:#?}", vib);
    Ok(())
}

pub fn check(fs: &TiFs) -> anyhow::Result<()> {
    let report = fs.check_disk()?;
    for s in report.cross_linked.iter()       { println!("Sector {:4}: cross linked", s) }
    for s in report.unallocated_in_use.iter() { println!("Sector {:4}: in use but marked free", s) }
    for s in report.allocated_unused.iter()   { println!("Sector {:4}: marked used but not in any file", s) }
    match report.is_clean() {
        true  => { println!("No problems found"); Ok(()) },
        false => Err(anyhow!("{} problem sectors", report.cross_linked.len() + report.unallocated_in_use.len() + report.allocated_unused.len())),
    }
}

pub fn mkfs(image: &Path, dtype: DiskType, name: &str) -> anyhow::Result<()> {
    let format = image_format_from_ext(image)?;
    let (file, _) = split_volume(image);
    if format != ImageFormat::Cf7 && file.exists() {
        return Err(anyhow!("{} already exists", file.to_string_lossy()));
    }
    let geometry = dtype.geometry();
    let media = DiskMedia::formatted(geometry).shared();
    DiskFs::format(Logical::with_geometry(media.clone(), geometry), name, &geometry)?;
    save_image(&media, image, format)
}

pub fn convert(media: &SharedMedia, image_type: ImageFormat, dest: &Path) -> anyhow::Result<()> {
    save_image(media, dest, image_type)
}

pub fn path_to_ti_filename(p: &Path) -> anyhow::Result<String> {
    Ok(p.to_str().ok_or(anyhow!("Bad filename: {}", p.to_string_lossy()))?
        .to_uppercase())
}

// Adapted from https://internals.rust-lang.org/t/pathbuf-has-set-extension-but-no-add-extension-cannot-cleanly-turn-tar-to-tar-gz/14187/10
use std::ffi::{OsString, OsStr};
trait Append {
    fn append(&self, ext: impl AsRef<OsStr>) -> PathBuf;
}

impl Append for Path {
    fn append(&self, ext: impl AsRef<OsStr>) -> PathBuf {
        let mut os_string: OsString = self.to_owned().into();
        os_string.push(ext.as_ref());
        os_string.into()
    }
}
