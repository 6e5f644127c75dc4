//! IDE/ATA disk driver (PIO, LBA28).
//!
//! Two legacy channels, two drives each. A channel is a shared command
//! register file, so every request takes the channel mutex for its whole
//! run; within a request the thread sleeps on the channel's *disk-done*
//! semaphore, which the IRQ handler raises when the controller signals
//! completion. Transfers are chunked at 256 sectors because the sector
//! count register is 8 bits wide (0 encodes 256).
//!
//! Failure policy: a device that stays busy past its 30-second budget is
//! a dead device; the driver panics rather than hand back partial
//! sectors.

// Register plumbing is exercised only in the bare-metal build
#![allow(dead_code)]

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use bitflags::bitflags;

use crate::irq::{VECTOR_IDE0, VECTOR_IDE1};
use crate::sync::{Lock, Semaphore};

/// Bytes per sector.
pub const SECTOR_SIZE: usize = 512;

/// Debug cap: the largest LBA the driver accepts (an 80 MiB disk).
pub const MAX_LBA: u32 = (80 * 1024 * 1024 / SECTOR_SIZE as u32) - 1;

/// Largest sector run one ATA command can carry.
pub const MAX_SECTORS_PER_OP: usize = 256;

/// Budget for a device to clear BSY, in milliseconds.
const BUSY_WAIT_BUDGET_MS: i32 = 30 * 1000;
/// Poll interval while the device is busy.
const BUSY_WAIT_STEP_MS: u32 = 10;

// Register offsets from a channel's base port.
const REG_DATA: u16 = 0;
const REG_SECT_CNT: u16 = 2;
const REG_LBA_LOW: u16 = 3;
const REG_LBA_MID: u16 = 4;
const REG_LBA_HIGH: u16 = 5;
const REG_DEVICE: u16 = 6;
const REG_STATUS: u16 = 7;
const REG_CMD: u16 = 7;

const CMD_READ_SECTORS: u8 = 0x20;
const CMD_WRITE_SECTORS: u8 = 0x30;

bitflags! {
    /// Status register bits the driver cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AtaStatus: u8 {
        /// Device is busy; other bits are invalid while set.
        const BSY  = 0x80;
        /// Device is spun up and ready.
        const DRDY = 0x40;
        /// Data is ready to transfer.
        const DRQ  = 0x08;
    }
}

bitflags! {
    /// Device register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AtaDevice: u8 {
        /// Bits 7 and 5 are architecturally always set.
        const MBS = 0xa0;
        /// LBA addressing (not CHS).
        const LBA = 0x40;
        /// Drive select: set = slave.
        const DEV = 0x10;
    }
}

/// Device register byte selecting `dev_no` with the top LBA nibble.
pub fn device_register(dev_no: u8, lba: u32) -> u8 {
    debug_assert!(dev_no < 2);
    let mut bits = AtaDevice::MBS | AtaDevice::LBA;
    if dev_no == 1 {
        bits |= AtaDevice::DEV;
    }
    bits.bits() | ((lba >> 24) & 0x0f) as u8
}

/// Sector-count register encoding (256 wraps to 0).
pub fn sector_count_byte(secs: usize) -> u8 {
    debug_assert!(secs >= 1 && secs <= MAX_SECTORS_PER_OP);
    secs as u8 // 256 truncates to 0, which the device reads as 256
}

/// Size of the next chunk of a `remaining`-sector transfer.
pub fn next_chunk(remaining: usize) -> usize {
    remaining.min(MAX_SECTORS_PER_OP)
}

/// One ATA channel: a register file, its IRQ, and the synchronization
/// that serializes commands over it.
pub struct IdeChannel {
    name: &'static str,
    port_base: u16,
    irq_vector: u8,
    /// Serializes whole requests on this channel.
    lock: Lock,
    /// Set after a command goes out; the IRQ handler consumes it.
    expecting_intr: AtomicBool,
    /// Raised by the IRQ handler when the controller finishes.
    disk_done: Semaphore,
}

impl IdeChannel {
    const fn new(name: &'static str, port_base: u16, irq_vector: u8) -> Self {
        Self {
            name,
            port_base,
            irq_vector,
            lock: Lock::new(),
            expecting_intr: AtomicBool::new(false),
            disk_done: Semaphore::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// The two legacy channels.
static CHANNELS: [IdeChannel; 2] = [
    IdeChannel::new("ide0", 0x1f0, VECTOR_IDE0),
    IdeChannel::new("ide1", 0x170, VECTOR_IDE1),
];

/// Channels actually present, derived from the BIOS drive count.
static CHANNEL_COUNT: AtomicU8 = AtomicU8::new(0);

const DISK_NAMES: [&str; 4] = ["hd0", "hd1", "hd2", "hd3"];

/// One drive on a channel.
#[derive(Debug, Clone, Copy)]
pub struct Disk {
    channel_idx: usize,
    /// 0 = master, 1 = slave.
    dev_no: u8,
}

impl Disk {
    pub const fn new(channel_idx: usize, dev_no: u8) -> Self {
        debug_assert!(channel_idx < 2);
        debug_assert!(dev_no < 2);
        Self {
            channel_idx,
            dev_no,
        }
    }

    fn channel(&self) -> &'static IdeChannel {
        &CHANNELS[self.channel_idx]
    }

    pub fn name(&self) -> &'static str {
        DISK_NAMES[self.channel_idx * 2 + self.dev_no as usize]
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod pio {
    use super::*;
    use crate::arch::x86::port::{insw, outsw, Port};
    use crate::drivers::timer::mtime_sleep;
    use crate::error::KernelError;

    fn reg(channel: &IdeChannel, offset: u16) -> Port<u8> {
        Port::new(channel.port_base + offset)
    }

    /// Select master/slave on the channel.
    fn select_disk(disk: &Disk) {
        let device = AtaDevice::MBS | AtaDevice::LBA;
        let device = if disk.dev_no == 1 {
            device | AtaDevice::DEV
        } else {
            device
        };
        // SAFETY: device register write on a locked channel.
        unsafe { reg(disk.channel(), REG_DEVICE).write(device.bits()) };
    }

    /// Program the start sector and run length of the next command.
    fn select_sector(disk: &Disk, lba: u32, secs: usize) {
        debug_assert!(lba <= MAX_LBA);
        let channel = disk.channel();
        // SAFETY: command block writes on a locked channel.
        unsafe {
            reg(channel, REG_SECT_CNT).write(sector_count_byte(secs));
            reg(channel, REG_LBA_LOW).write(lba as u8);
            reg(channel, REG_LBA_MID).write((lba >> 8) as u8);
            reg(channel, REG_LBA_HIGH).write((lba >> 16) as u8);
            // LBA bits 24-27 ride in the device register, so rewrite it.
            reg(channel, REG_DEVICE).write(device_register(disk.dev_no, lba));
        }
    }

    /// Issue a command and arm the completion interrupt.
    fn cmd_out(channel: &IdeChannel, cmd: u8) {
        channel.expecting_intr.store(true, Ordering::Release);
        // SAFETY: command register write on a locked channel.
        unsafe { reg(channel, REG_CMD).write(cmd) };
    }

    fn read_status(channel: &IdeChannel) -> AtaStatus {
        // SAFETY: status reads have no data side effects (they do clear
        // the interrupt condition, which is intended here).
        AtaStatus::from_bits_truncate(unsafe { reg(channel, REG_STATUS).read() })
    }

    /// Wait (sleeping, not spinning) for the device to clear BSY, then
    /// report whether it has data to move. Gives up after the 30 s
    /// budget.
    fn busy_wait(disk: &Disk) -> bool {
        let channel = disk.channel();
        let mut budget_ms = BUSY_WAIT_BUDGET_MS;
        while budget_ms > 0 {
            if !read_status(channel).contains(AtaStatus::BSY) {
                return read_status(channel).contains(AtaStatus::DRQ);
            }
            mtime_sleep(BUSY_WAIT_STEP_MS);
            budget_ms -= BUSY_WAIT_STEP_MS as i32;
        }
        false
    }

    fn timeout_panic(disk: &Disk, lba: u32) -> ! {
        panic!(
            "{}",
            KernelError::DeviceTimeout {
                device: disk.name(),
                lba,
            }
        );
    }

    /// Read `sec_cnt` sectors starting at `lba` into `buf`.
    pub fn ide_read(disk: &Disk, lba: u32, buf: &mut [u8], sec_cnt: usize) {
        assert!(lba <= MAX_LBA);
        assert!(sec_cnt > 0);
        assert!(buf.len() >= sec_cnt * SECTOR_SIZE);

        let channel = disk.channel();
        channel.lock.acquire();
        select_disk(disk);

        let mut done = 0;
        while done < sec_cnt {
            let secs = next_chunk(sec_cnt - done);
            select_sector(disk, lba + done as u32, secs);
            cmd_out(channel, CMD_READ_SECTORS);

            // The controller is now working; sleep until its interrupt
            // instead of burning the CPU on a slow device.
            channel.disk_done.down();

            if !busy_wait(disk) {
                timeout_panic(disk, lba + done as u32);
            }
            // SAFETY: bounds asserted above; the device has `secs`
            // sectors ready after DRQ.
            unsafe {
                insw(
                    channel.port_base + REG_DATA,
                    buf.as_mut_ptr().add(done * SECTOR_SIZE),
                    secs * SECTOR_SIZE / 2,
                );
            }
            done += secs;
        }
        channel.lock.release();
    }

    /// Write `sec_cnt` sectors starting at `lba` from `buf`.
    pub fn ide_write(disk: &Disk, lba: u32, buf: &[u8], sec_cnt: usize) {
        assert!(lba <= MAX_LBA);
        assert!(sec_cnt > 0);
        assert!(buf.len() >= sec_cnt * SECTOR_SIZE);

        let channel = disk.channel();
        channel.lock.acquire();
        select_disk(disk);

        let mut done = 0;
        while done < sec_cnt {
            let secs = next_chunk(sec_cnt - done);
            select_sector(disk, lba + done as u32, secs);
            cmd_out(channel, CMD_WRITE_SECTORS);

            // Writes are ready for data before any interrupt: wait for
            // DRQ first, push the sectors, then sleep until completion.
            if !busy_wait(disk) {
                timeout_panic(disk, lba + done as u32);
            }
            // SAFETY: bounds asserted above; the device asked for
            // exactly `secs` sectors of data.
            unsafe {
                outsw(
                    channel.port_base + REG_DATA,
                    buf.as_ptr().add(done * SECTOR_SIZE),
                    secs * SECTOR_SIZE / 2,
                );
            }
            channel.disk_done.down();
            done += secs;
        }
        channel.lock.release();
    }

    /// Channel IRQ handler: wake the sleeping requester.
    pub(super) fn intr_handler(vector: u8) {
        debug_assert!(vector == VECTOR_IDE0 || vector == VECTOR_IDE1);
        let channel = &CHANNELS[(vector - VECTOR_IDE0) as usize];
        debug_assert_eq!(channel.irq_vector, vector);

        // A request holds the channel lock for its whole lifetime, so a
        // set flag can only belong to the in-flight command. Spurious
        // interrupts (flag clear) are dropped.
        if channel.expecting_intr.swap(false, Ordering::AcqRel) {
            channel.disk_done.up();
            // Reading the status register tells the controller its
            // interrupt was seen, re-arming it for the next command.
            let _ = read_status(channel);
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use pio::{ide_read, ide_write};

/// Number of channels in service.
pub fn channel_count() -> u8 {
    CHANNEL_COUNT.load(Ordering::Relaxed)
}

/// Discover drives and hook the channel interrupts.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init() -> crate::error::KernelResult<()> {
    // SAFETY: the BIOS data area records the drive count at this byte.
    let hd_cnt =
        unsafe { core::ptr::read_volatile(crate::mm::DRIVE_COUNT_VADDR as *const u8) };
    assert!(hd_cnt > 0, "no disks reported by firmware");
    let channels = (hd_cnt as usize).div_ceil(2).min(CHANNELS.len()) as u8;
    CHANNEL_COUNT.store(channels, Ordering::Relaxed);

    for channel in CHANNELS.iter().take(channels as usize) {
        crate::irq::register_handler(channel.irq_vector, pio::intr_handler)?;
    }
    log::info!("ide: {hd_cnt} drive(s) on {channels} channel(s)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_register_packs_drive_and_lba() {
        // Master, LBA top nibble zero: just the fixed + LBA bits.
        assert_eq!(device_register(0, 0), 0xe0);
        // Slave adds the DEV bit.
        assert_eq!(device_register(1, 0), 0xf0);
        // Bits 24-27 of the LBA land in the low nibble.
        assert_eq!(device_register(0, 0x0f00_0000), 0xef);
        assert_eq!(device_register(0, 0x0a12_3456), 0xea);
    }

    #[test]
    fn sector_count_encodes_256_as_zero() {
        assert_eq!(sector_count_byte(1), 1);
        assert_eq!(sector_count_byte(255), 255);
        assert_eq!(sector_count_byte(256), 0);
    }

    #[test]
    fn transfers_chunk_at_256() {
        assert_eq!(next_chunk(1000), 256);
        assert_eq!(next_chunk(256), 256);
        assert_eq!(next_chunk(200), 200);

        // A 1000-sector request takes 3 full chunks and a 232 tail.
        let mut remaining = 1000;
        let mut chunks = std::vec::Vec::new();
        while remaining > 0 {
            let c = next_chunk(remaining);
            chunks.push(c);
            remaining -= c;
        }
        assert_eq!(chunks, [256, 256, 256, 232]);
    }

    #[test]
    fn lba_cap_is_80_mib() {
        assert_eq!(MAX_LBA, 163_839);
    }

    #[test]
    fn status_bits_match_hardware() {
        assert_eq!(AtaStatus::BSY.bits(), 0x80);
        assert_eq!(AtaStatus::DRDY.bits(), 0x40);
        assert_eq!(AtaStatus::DRQ.bits(), 0x08);
        let status = AtaStatus::from_bits_truncate(0x58);
        assert!(status.contains(AtaStatus::DRDY));
        assert!(status.contains(AtaStatus::DRQ));
        assert!(!status.contains(AtaStatus::BSY));
    }

    #[test]
    fn disks_name_by_channel_and_position() {
        assert_eq!(Disk::new(0, 0).name(), "hd0");
        assert_eq!(Disk::new(0, 1).name(), "hd1");
        assert_eq!(Disk::new(1, 0).name(), "hd2");
        assert_eq!(Disk::new(1, 1).name(), "hd3");
    }
}
