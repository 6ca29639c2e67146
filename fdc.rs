// Copyright © 2023 David Caldwell <david@porkrind.org>

//! WD1771 floppy controller as wired up on the TI disk controller card.
//!
//! The CPU sees the controller through eight memory mapped registers in the card's DSR page (with the data
//! bus inverted) plus a handful of CRU bits for drive/head selection and motor control. All transfers are
//! byte serial: a read or write command arms a buffer and the CPU moves it one byte at a time through the
//! data register. Errors are never returned to the caller; they only ever show up as status bits.

use std::fmt::Debug;

use anyhow::anyhow;
use bytebuffer::{ByteBuffer, Endian};
use log::{debug, trace, warn};

use crate::block::track::{Density, Sector, CRC_PLACEHOLDER, DATA_MARK, ID_MARK};
use crate::block::{DiskMedia, SharedMedia, MAX_TRACKS};

pub const DRIVES: usize = 3;

// 3 MHz CPU, 300 RPM
pub const REVOLUTION_CLOCKS: u64 = 600_000;
pub const INDEX_PULSE_CLOCKS: u64 = 12_000;

pub const DSR_BASE: u16 = 0x4000;
pub const READ_STATUS:   u16 = 0x1FF0;
pub const READ_TRACK:    u16 = 0x1FF2;
pub const READ_SECTOR:   u16 = 0x1FF4;
pub const READ_DATA:     u16 = 0x1FF6;
pub const WRITE_COMMAND: u16 = 0x1FF8;
pub const WRITE_TRACK:   u16 = 0x1FFA;
pub const WRITE_SECTOR:  u16 = 0x1FFC;
pub const WRITE_DATA:    u16 = 0x1FFE;

pub const TRAP_READ: u8  = 0x01;
pub const TRAP_WRITE: u8 = 0x02;

// Status register. Several bits mean different things after type I and type II/III commands.
pub const NOT_READY: u8        = 0x80;
pub const WRITE_PROTECT: u8    = 0x40;
pub const HEAD_LOADED: u8      = 0x20; // Type I
pub const RECORD_TYPE: u8      = 0x60; // Read sector
pub const SEEK_ERROR: u8       = 0x10; // Type I
pub const RECORD_NOT_FOUND: u8 = 0x10; // Type II/III
pub const CRC_ERROR: u8        = 0x08;
pub const TRACK_0: u8          = 0x04; // Type I
pub const LOST_DATA: u8        = 0x04; // Type II/III
pub const INDEX: u8            = 0x02; // Type I
pub const DRQ: u8              = 0x02; // Type II/III
pub const BUSY: u8             = 0x01;

// Command flag bits
const UPDATE_TRACK: u8 = 0x10;
const VERIFY: u8       = 0x04;
const MULTI_RECORD: u8 = 0x10;

// Write track: this byte is replaced by the two CRC bytes of the preceding field.
const WRITE_CRC: u8 = 0xF7;

const STATE_VERSION: u8 = 1;

/// What the controller needs from the CPU core that drives it.
pub trait Cpu {
    fn pc(&self) -> u16;
    fn clocks(&self) -> u64;
    fn set_trap(&mut self, address: u16, flags: u8, handler: usize) -> bool;
    fn clear_trap(&mut self, address: u16);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    #[default]
    None,
    ReadAddress,
    ReadTrack,
    ReadSector,
    WriteTrack,
    WriteSector,
}

impl TryFrom<u8> for Command {
    type Error = anyhow::Error;
    fn try_from(b: u8) -> anyhow::Result<Command> {
        Ok(match b {
            0 => Command::None,
            1 => Command::ReadAddress,
            2 => Command::ReadTrack,
            3 => Command::ReadSector,
            4 => Command::WriteTrack,
            5 => Command::WriteSector,
            _ => return Err(anyhow!("Bad command state {}", b)),
        })
    }
}

// Where an in-flight command reads from or writes to, latched when the command was issued.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Target {
    drive: usize,
    side: usize,
    track: usize,
    cylinder: u8,
    sector: u8,
}

#[derive(Default)]
pub struct Fdc {
    drives: [Option<SharedMedia>; DRIVES],

    status: u8,
    track: u8,
    sector: u8,
    data: u8,
    head_track: u8,
    step_in: bool,
    type_one: bool,

    command: Command,
    multi: bool,
    write_mark: u8,
    target: Target,
    buffer: Vec<u8>,
    index: usize,
    deadline: u64,

    // CRU latches
    rom_enabled: bool,
    motor: bool,
    wait_enabled: bool,
    head_loaded: bool,
    drive_select: u8,
    head: u8,
}

fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF, |crc, &b| {
        (0..8).fold(crc ^ (b as u16) << 8, |crc, _| match crc & 0x8000 {
            0 => crc << 1,
            _ => crc << 1 ^ 0x1021,
        })
    })
}

fn record_type(mark: u8) -> u8 {
    (DATA_MARK.wrapping_sub(mark) & 0x03) << 5
}

impl Fdc {
    pub fn new() -> Fdc {
        Fdc { type_one: true, ..Default::default() }
    }

    /// Puts media in a drive (or empties it), returning whatever was there before.
    pub fn insert(&mut self, drive: usize, media: Option<SharedMedia>) -> Option<SharedMedia> {
        let Some(slot) = self.drives.get_mut(drive) else {
            warn!("No drive {}", drive);
            return None;
        };
        std::mem::replace(slot, media)
    }

    pub fn media(&self, drive: usize) -> Option<SharedMedia> {
        self.drives.get(drive)?.clone()
    }

    pub fn activate(&self, cpu: &mut dyn Cpu, handler: usize) -> anyhow::Result<()> {
        for reg in [READ_STATUS, READ_TRACK, READ_SECTOR, READ_DATA] {
            if !cpu.set_trap(DSR_BASE + reg, TRAP_READ, handler) {
                return Err(anyhow!("Couldn't trap reads of {:04X}", DSR_BASE + reg));
            }
        }
        for reg in [WRITE_COMMAND, WRITE_TRACK, WRITE_SECTOR, WRITE_DATA] {
            if !cpu.set_trap(DSR_BASE + reg, TRAP_WRITE, handler) {
                return Err(anyhow!("Couldn't trap writes of {:04X}", DSR_BASE + reg));
            }
        }
        Ok(())
    }

    pub fn deactivate(&self, cpu: &mut dyn Cpu) {
        for reg in [READ_STATUS, READ_TRACK, READ_SECTOR, READ_DATA, WRITE_COMMAND, WRITE_TRACK, WRITE_SECTOR, WRITE_DATA] {
            cpu.clear_trap(DSR_BASE + reg);
        }
    }

    /// Memory trap callback. Returns the value the CPU sees on a read.
    pub fn trap(&mut self, cpu: &dyn Cpu, is_read: bool, address: u16, value: u8) -> u8 {
        if !self.rom_enabled {
            return value;
        }
        let clocks = cpu.clocks();
        match (is_read, address.wrapping_sub(DSR_BASE)) {
            (true, READ_STATUS)    => !self.read_status(clocks),
            (true, READ_TRACK)     => !self.track,
            (true, READ_SECTOR)    => !self.sector,
            (true, READ_DATA)      => !self.read_data(clocks),
            (false, WRITE_COMMAND) => { debug!("PC {:04X}: command {:02X}", cpu.pc(), !value); self.write_command(!value, clocks); value },
            (false, WRITE_TRACK)   => { self.track = !value; value },
            (false, WRITE_SECTOR)  => { self.sector = !value; value },
            (false, WRITE_DATA)    => { self.write_data(!value, clocks); value },
            _ => {
                trace!("PC {:04X}: stray {} of {:04X}", cpu.pc(), if is_read { "read" } else { "write" }, address);
                value
            },
        }
    }

    pub fn read_cru(&self, bit: u8) -> bool {
        match bit {
            0     => self.head_loaded,
            1..=3 => self.drive_select & 1 << (bit - 1) != 0,
            4     => self.motor,
            6     => true,
            7     => self.head != 0,
            _     => false,
        }
    }

    pub fn write_cru(&mut self, bit: u8, value: bool) {
        match bit {
            0 => self.rom_enabled = value,
            1 => self.motor = value,
            2 => self.wait_enabled = value,
            3 => self.head_loaded = value,
            4..=6 => match value {
                true  => self.drive_select |= 1 << (bit - 4),
                false => self.drive_select &= !(1 << (bit - 4)),
            },
            7 => self.head = value as u8,
            _ => {},
        }
    }

    pub fn track(&self) -> u8                 { self.track }
    pub fn sector(&self) -> u8                { self.sector }
    pub fn set_track(&mut self, track: u8)    { self.track = track }
    pub fn set_sector(&mut self, sector: u8)  { self.sector = sector }
    pub fn head_track(&self) -> u8            { self.head_track }
    pub fn command(&self) -> Command          { self.command }
    pub fn is_waiting(&self) -> bool          { self.wait_enabled && self.command != Command::None }

    // The one-hot select lines; the lowest line wins if software sets several.
    fn selected_drive(&self) -> Option<usize> {
        (0..DRIVES).find(|d| self.drive_select & 1 << d != 0)
    }

    fn selected(&self) -> Option<SharedMedia> {
        self.media(self.selected_drive()?)
    }

    pub fn read_status(&mut self, clocks: u64) -> u8 {
        if self.command != Command::None && clocks > self.deadline {
            debug!("{:?} didn't finish within a revolution", self.command);
            self.complete();
        }
        let media = self.selected();
        let mut status = self.status;
        match media {
            None => status |= NOT_READY,
            Some(media) if self.type_one => {
                if media.borrow().is_write_protected() { status |= WRITE_PROTECT }
                if self.motor && clocks % REVOLUTION_CLOCKS < INDEX_PULSE_CLOCKS { status |= INDEX }
            },
            Some(_) => {},
        }
        if self.type_one {
            if self.head_loaded { status |= HEAD_LOADED }
            if self.head_track == 0 { status |= TRACK_0 }
        }
        status
    }

    pub fn write_command(&mut self, cmd: u8, clocks: u64) {
        let interrupted = self.complete();
        debug!("Command {:02X} (drive {:?}, head {}, track {}/{}, sector {})",
               cmd, self.selected_drive(), self.head, self.track, self.head_track, self.sector);
        match cmd >> 4 {
            0x0 => {
                self.head_track = 0;
                self.track = 0;
                self.step_in = false;
                self.end_type_one(cmd);
            },
            0x1 => self.seek(cmd),
            0x2 | 0x3 => self.step(cmd, self.step_in),
            0x4 | 0x5 => self.step(cmd, true),
            0x6 | 0x7 => self.step(cmd, false),
            0x8 | 0x9 => self.begin_read_sector(cmd, clocks),
            0xA | 0xB => self.begin_write_sector(cmd, clocks),
            0xC => self.begin_read_address(clocks),
            // An interrupted command leaves its status behind; otherwise status reverts to the type I view.
            0xD => if !interrupted {
                self.status = 0;
                self.type_one = true;
            },
            0xE => self.begin_read_track(clocks),
            _ => self.begin_write_track(clocks),
        }
    }

    pub fn read_data(&mut self, clocks: u64) -> u8 {
        let reading = matches!(self.command, Command::ReadSector | Command::ReadTrack | Command::ReadAddress);
        if reading && self.index < self.buffer.len() {
            self.data = self.buffer[self.index];
            self.index += 1;
            trace!("Read {:02X} ({}/{})", self.data, self.index, self.buffer.len());
            if self.index == self.buffer.len() {
                self.end_of_read(clocks);
            }
        }
        self.data
    }

    pub fn write_data(&mut self, value: u8, clocks: u64) {
        self.data = value;
        match self.command {
            Command::WriteSector => {
                if let Some(b) = self.buffer.get_mut(self.index) {
                    *b = value;
                    self.index += 1;
                    trace!("Write {:02X} ({}/{})", value, self.index, self.buffer.len());
                }
                if self.index == self.buffer.len() {
                    self.commit_sector(clocks);
                }
            },
            Command::WriteTrack => {
                match value {
                    WRITE_CRC => self.buffer.extend_from_slice(&[CRC_PLACEHOLDER, CRC_PLACEHOLDER]),
                    _ => self.buffer.push(value),
                }
                self.index = self.buffer.len();
                trace!("Write track {:02X} ({})", value, self.index);
                if self.buffer.len() >= Density::Single.layout().track_size {
                    self.commit_track();
                    self.finish();
                }
            },
            _ => {},
        }
    }

    // Force-completes whatever is in flight. A partial track write is kept; a partial sector write is lost.
    fn complete(&mut self) -> bool {
        match self.command {
            Command::None => return false,
            Command::WriteTrack => self.commit_track(),
            Command::WriteSector if self.index < self.buffer.len() => {
                debug!("Sector write abandoned after {} bytes", self.index);
                self.status |= LOST_DATA;
            },
            _ => {},
        }
        self.finish();
        true
    }

    fn finish(&mut self) {
        self.command = Command::None;
        self.status &= !(BUSY | DRQ);
        self.buffer.clear();
        self.index = 0;
    }

    fn arm(&mut self, command: Command, buffer: Vec<u8>, clocks: u64) {
        self.command = command;
        self.buffer = buffer;
        self.index = 0;
        self.deadline = clocks + REVOLUTION_CLOCKS;
        self.status |= BUSY | DRQ;
    }

    fn end_type_one(&mut self, cmd: u8) {
        self.type_one = true;
        self.status = 0;
        if cmd & VERIFY != 0 && !self.verify() {
            debug!("Verify failed: head on track {}, track register {}", self.head_track, self.track);
            self.status |= SEEK_ERROR;
        }
    }

    // The head's track must carry at least one ID with the track register's cylinder.
    fn verify(&self) -> bool {
        let Some(media) = self.selected() else { return false };
        let media = media.borrow();
        let found = media.track(self.head_track as usize, self.head as usize)
            .map(|t| t.sectors.iter().any(|s| s.id.cylinder == self.track))
            .unwrap_or(false);
        found
    }

    fn move_head(&mut self, inward: bool) {
        self.head_track = match inward {
            true  => (self.head_track + 1).min(MAX_TRACKS as u8 - 1),
            false => self.head_track.saturating_sub(1),
        };
    }

    fn seek(&mut self, cmd: u8) {
        let dest = self.data;
        while self.track != dest {
            let inward = dest > self.track;
            self.step_in = inward;
            self.move_head(inward);
            self.track = if inward { self.track + 1 } else { self.track - 1 };
        }
        self.end_type_one(cmd);
    }

    fn step(&mut self, cmd: u8, inward: bool) {
        self.step_in = inward;
        self.move_head(inward);
        if cmd & UPDATE_TRACK != 0 {
            self.track = if inward { self.track.wrapping_add(1) } else { self.track.wrapping_sub(1) };
        }
        self.end_type_one(cmd);
    }

    fn latch_target(&mut self) -> Option<SharedMedia> {
        self.type_one = false;
        self.status = 0;
        let Some(drive) = self.selected_drive() else { self.status = NOT_READY; return None };
        let Some(media) = self.media(drive) else { self.status = NOT_READY; return None };
        self.target = Target {
            drive,
            side: self.head as usize,
            track: self.head_track as usize,
            cylinder: self.track,
            sector: self.sector,
        };
        Some(media)
    }

    fn find_target(&mut self, media: &DiskMedia) -> Option<Sector> {
        self.target.sector = self.sector;
        let t = self.target;
        let found = media.find_sector(t.track, t.side, t.sector, t.cylinder);
        if found.is_none() {
            debug!("Record not found: track {} side {} sector {} cylinder {}", t.track, t.side, t.sector, t.cylinder);
            self.status = RECORD_NOT_FOUND;
        }
        found
    }

    fn begin_read_sector(&mut self, cmd: u8, clocks: u64) {
        self.multi = cmd & MULTI_RECORD != 0;
        let Some(media) = self.latch_target() else { return };
        self.load_sector(&media.borrow(), clocks);
    }

    fn load_sector(&mut self, media: &DiskMedia, clocks: u64) {
        let Some(s) = self.find_target(media) else { return };
        let Some(track) = media.track(self.target.track, self.target.side) else { return };
        self.status = record_type(s.data_mark);
        self.arm(Command::ReadSector, track.sector_data(&s).to_vec(), clocks);
    }

    fn end_of_read(&mut self, clocks: u64) {
        let command = self.command;
        self.finish();
        if command == Command::ReadSector && self.multi {
            self.sector = self.sector.wrapping_add(1);
            if let Some(media) = self.media(self.target.drive) {
                self.load_sector(&media.borrow(), clocks);
            }
        }
    }

    // A write to a protected disk is refused before it latches anything. Only the status shows it.
    fn refuse_protected_write(&mut self) -> bool {
        let protected = self.selected().map_or(false, |m| m.borrow().is_write_protected());
        if protected {
            debug!("Write refused: disk is write protected");
            self.type_one = false;
            self.status = WRITE_PROTECT;
        }
        protected
    }

    fn begin_write_sector(&mut self, cmd: u8, clocks: u64) {
        if self.refuse_protected_write() {
            return;
        }
        self.multi = cmd & MULTI_RECORD != 0;
        self.write_mark = DATA_MARK - (cmd & 0x03);
        let Some(media) = self.latch_target() else { return };
        self.arm_write_sector(&media.borrow(), clocks);
    }

    fn arm_write_sector(&mut self, media: &DiskMedia, clocks: u64) {
        if media.is_write_protected() {
            self.status = WRITE_PROTECT;
            return;
        }
        let Some(s) = self.find_target(media) else { return };
        self.status = 0;
        self.arm(Command::WriteSector, vec![0; s.len()], clocks);
    }

    fn commit_sector(&mut self, clocks: u64) {
        let t = self.target;
        let buffer = std::mem::take(&mut self.buffer);
        self.finish();
        let Some(media) = self.media(t.drive) else { self.status |= NOT_READY; return };
        if !media.borrow_mut().write_sector(t.track, t.side, t.sector, t.cylinder, &buffer, Some(self.write_mark)) {
            self.status |= RECORD_NOT_FOUND;
            return;
        }
        debug!("Wrote track {} side {} sector {}", t.track, t.side, t.sector);
        if self.multi {
            self.sector = self.sector.wrapping_add(1);
            self.arm_write_sector(&media.borrow(), clocks);
        }
    }

    fn begin_read_address(&mut self, clocks: u64) {
        let Some(media) = self.latch_target() else { return };
        let media = media.borrow();
        let t = self.target;
        let Some(track) = media.track(t.track, t.side).filter(|t| !t.sectors.is_empty()) else {
            self.status = RECORD_NOT_FOUND;
            return;
        };
        // Whichever ID is passing under the head right now.
        let n = track.sectors.len();
        let id = track.sectors[((clocks % REVOLUTION_CLOCKS) as usize * n / REVOLUTION_CLOCKS as usize).min(n - 1)].id;
        let crc = crc16(&[ID_MARK, id.cylinder, id.side, id.sector, id.size]);
        let [hi, lo] = crc.to_be_bytes();
        self.sector = id.cylinder;
        self.arm(Command::ReadAddress, vec![id.cylinder, id.side, id.sector, id.size, hi, lo], clocks);
    }

    fn begin_read_track(&mut self, clocks: u64) {
        let Some(media) = self.latch_target() else { return };
        let media = media.borrow();
        let Some(track) = media.track(self.target.track, self.target.side) else {
            self.status = RECORD_NOT_FOUND;
            return;
        };
        self.arm(Command::ReadTrack, track.data.clone(), clocks);
    }

    // The 1771 only writes FM, so a written track is always an FM track. Formatting a double density track
    // through it replaces that track with whatever FM track the host sends.
    fn begin_write_track(&mut self, clocks: u64) {
        if self.refuse_protected_write() {
            return;
        }
        let Some(media) = self.latch_target() else { return };
        if media.borrow().track(self.target.track, self.target.side).map_or(false, |t| t.density == Density::Double) {
            warn!("Write track over double density track {} side {}: the new track will be FM",
                  self.target.track, self.target.side);
        }
        self.arm(Command::WriteTrack, Vec::with_capacity(Density::Single.layout().track_size), clocks);
    }

    fn commit_track(&mut self) {
        let t = self.target;
        let Some(media) = self.media(t.drive) else { return };
        debug!("Write track {} side {}: {} bytes", t.track, t.side, self.buffer.len());
        if !media.borrow_mut().write_track(t.track, t.side, &self.buffer) {
            self.status |= WRITE_PROTECT;
        }
    }

    pub fn save_state(&self) -> Vec<u8> {
        let mut buf = ByteBuffer::new();
        buf.set_endian(Endian::BigEndian);
        buf.write_u8(STATE_VERSION);
        for b in [self.status, self.track, self.sector, self.data, self.head_track] {
            buf.write_u8(b);
        }
        for flag in [self.step_in, self.type_one, self.multi] {
            buf.write_u8(flag as u8);
        }
        buf.write_u8(self.command as u8);
        buf.write_u8(self.write_mark);
        buf.write_u8(self.target.drive as u8);
        buf.write_u8(self.target.side as u8);
        buf.write_u8(self.target.track as u8);
        buf.write_u8(self.target.cylinder);
        buf.write_u8(self.target.sector);
        buf.write_u64(self.deadline);
        for flag in [self.rom_enabled, self.motor, self.wait_enabled, self.head_loaded] {
            buf.write_u8(flag as u8);
        }
        buf.write_u8(self.drive_select);
        buf.write_u8(self.head);
        buf.write_u16(self.buffer.len() as u16);
        buf.write_bytes(&self.buffer);
        buf.write_u16(self.index as u16);
        buf.into_vec()
    }

    /// Restores registers and any in-flight transfer. Media stays whatever is currently inserted.
    pub fn load_state(&mut self, state: &[u8]) -> anyhow::Result<()> {
        let mut buf = ByteBuffer::from_bytes(state);
        buf.set_endian(Endian::BigEndian);
        let version = buf.read_u8()?;
        if version != STATE_VERSION {
            return Err(anyhow!("Unsupported controller state version {}", version));
        }
        let mut fdc = Fdc { drives: self.drives.clone(), ..Default::default() };
        fdc.status     = buf.read_u8()?;
        fdc.track      = buf.read_u8()?;
        fdc.sector     = buf.read_u8()?;
        fdc.data       = buf.read_u8()?;
        fdc.head_track = buf.read_u8()?;
        fdc.step_in    = buf.read_u8()? != 0;
        fdc.type_one   = buf.read_u8()? != 0;
        fdc.multi      = buf.read_u8()? != 0;
        fdc.command    = Command::try_from(buf.read_u8()?)?;
        fdc.write_mark = buf.read_u8()?;
        fdc.target = Target {
            drive:    buf.read_u8()? as usize,
            side:     buf.read_u8()? as usize,
            track:    buf.read_u8()? as usize,
            cylinder: buf.read_u8()?,
            sector:   buf.read_u8()?,
        };
        fdc.deadline     = buf.read_u64()?;
        fdc.rom_enabled  = buf.read_u8()? != 0;
        fdc.motor        = buf.read_u8()? != 0;
        fdc.wait_enabled = buf.read_u8()? != 0;
        fdc.head_loaded  = buf.read_u8()? != 0;
        fdc.drive_select = buf.read_u8()?;
        fdc.head         = buf.read_u8()?;
        let len = buf.read_u16()? as usize;
        fdc.buffer = buf.read_bytes(len)?;
        fdc.index = buf.read_u16()? as usize;
        if fdc.index > fdc.buffer.len() || fdc.target.drive >= DRIVES {
            return Err(anyhow!("Corrupt controller state"));
        }
        *self = fdc;
        Ok(())
    }
}

impl Debug for Fdc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            write!(f, "Status: {:02X}  Track: {:3}  Sector: {:3}  Data: {:02X}  Head on track {}\n",
                   self.status, self.track, self.sector, self.data, self.head_track)?;
            write!(f, "Command: {:?}{}", self.command, if self.multi { " (multi)" } else { "" })?;
            if self.command != Command::None {
                write!(f, " {}/{} bytes, {:?}", self.index, self.buffer.len(), self.target)?;
            }
            write!(f, "\nCRU: rom={} motor={} wait={} head_loaded={} select={:03b} head={}",
                   self.rom_enabled as u8, self.motor as u8, self.wait_enabled as u8, self.head_loaded as u8,
                   self.drive_select, self.head)
        } else {
            f.debug_struct("Fdc")
                .field("status",     &self.status)
                .field("track",      &self.track)
                .field("sector",     &self.sector)
                .field("head_track", &self.head_track)
                .field("command",    &self.command)
                .finish()
        }
    }
}
