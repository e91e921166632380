//! System bus: memory map, cartridge, RAM, and the Z80 I/O port decode.
//!
//! The 64KB address space is dispatched through a page table with 1KB
//! granularity, so bank windows down to the Sega mapper's 0x0400-aligned
//! first window map exactly. Reads resolve to ROM, RAM, cartridge RAM,
//! battery SRAM or the Janggun bit-flip handler; writes resolve to RAM,
//! cartridge RAM, banked SRAM, or fall through to the mapper engine for
//! bank switching and scheme detection.
//!
//! I/O ports decode on `port & 0xc1` as on real hardware, with the FM unit
//! ports at 0xf0-0xf2 checked first.

use crate::io::{FmUnit, Keyboard, LightGun, NullSound, Printer, Psg};
use crate::mappers::{self, MapperKind};
use crate::tape::Tape;
use crate::vdp::Vdp;
use crate::{header, Config, HwFlags, Profile, Region};
use sega8_core::cpu_z80::{BusZ80, CpuView};
use serde::{Deserialize, Serialize};

const PAGE_SHIFT: u16 = 10;
const PAGE_SIZE: u16 = 1 << PAGE_SHIFT;
const PAGE_MASK: u16 = PAGE_SIZE - 1;
const N_PAGES: usize = 0x10000 >> PAGE_SHIFT;

/// System RAM size (8KB, mirrored through 0xc000-0xffff)
pub const RAM_SIZE: usize = 0x2000;
/// Cartridge RAM size (32KB, also holds the 8KB adaptor variant)
pub const EXT_RAM_SIZE: usize = 0x8000;
/// Battery SRAM size (2 banks of 16KB)
pub const SRAM_SIZE: usize = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadTarget {
    /// Unmapped, reads 0xff
    Open,
    /// ROM at byte offset
    Rom(u32),
    /// System RAM at byte offset
    Ram(u16),
    /// Cartridge RAM at byte offset
    Ext(u16),
    /// Battery SRAM at byte offset
    Sram(u32),
    /// Janggun bank with hardware bit flip, resolved through the bank
    /// registers at read time
    Janggun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteTarget {
    Ignore,
    Ram(u16),
    Ext(u16),
    /// Banked battery SRAM, bank from the Sega mapper control register
    SramBank,
    /// Bank switching engine (and RAM write-through above 0xc000)
    Mapper,
}

/// Page-granular address decode tables
pub(crate) struct MemMap {
    read: [ReadTarget; N_PAGES],
    write: [WriteTarget; N_PAGES],
}

impl MemMap {
    fn new() -> Self {
        Self {
            read: [ReadTarget::Open; N_PAGES],
            write: [WriteTarget::Ignore; N_PAGES],
        }
    }

    fn set_read(&mut self, start: u16, end: u16, f: impl Fn(u16) -> ReadTarget) {
        debug_assert!(start & PAGE_MASK == 0 && end & PAGE_MASK == PAGE_MASK);
        for page in (start >> PAGE_SHIFT)..=(end >> PAGE_SHIFT) {
            self.read[page as usize] = f((page << PAGE_SHIFT) - start);
        }
    }

    fn set_write(&mut self, start: u16, end: u16, f: impl Fn(u16) -> WriteTarget) {
        debug_assert!(start & PAGE_MASK == 0 && end & PAGE_MASK == PAGE_MASK);
        for page in (start >> PAGE_SHIFT)..=(end >> PAGE_SHIFT) {
            self.write[page as usize] = f((page << PAGE_SHIFT) - start);
        }
    }

    pub(crate) fn map_rom_read(&mut self, start: u16, end: u16, base: u32) {
        self.set_read(start, end, |off| ReadTarget::Rom(base + off as u32));
    }

    pub(crate) fn map_ram_read(&mut self, start: u16, end: u16, base: u16) {
        self.set_read(start, end, |off| ReadTarget::Ram(base + off));
    }

    pub(crate) fn map_ram_write(&mut self, start: u16, end: u16, base: u16) {
        self.set_write(start, end, |off| WriteTarget::Ram(base + off));
    }

    pub(crate) fn map_ext_read(&mut self, start: u16, end: u16, base: u16) {
        self.set_read(start, end, |off| ReadTarget::Ext(base + off));
    }

    pub(crate) fn map_ext_write(&mut self, start: u16, end: u16, base: u16) {
        self.set_write(start, end, |off| WriteTarget::Ext(base + off));
    }

    pub(crate) fn map_sram_read(&mut self, start: u16, end: u16, base: u32) {
        self.set_read(start, end, |off| ReadTarget::Sram(base + off as u32));
    }

    pub(crate) fn map_sram_bank_write(&mut self, start: u16, end: u16) {
        self.set_write(start, end, |_| WriteTarget::SramBank);
    }

    pub(crate) fn map_mapper_write(&mut self, start: u16, end: u16) {
        self.set_write(start, end, |_| WriteTarget::Mapper);
    }

    pub(crate) fn map_janggun_read(&mut self, start: u16, end: u16) {
        self.set_read(start, end, |_| ReadTarget::Janggun);
    }
}

/// Battery-backed cartridge SRAM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sram {
    pub data: Vec<u8>,
    /// Set whenever a write changed the contents, for the frontend's
    /// save-file flushing
    pub changed: bool,
}

/// The machine: everything the CPU reaches through its bus
pub struct SmsBus {
    pub rom: Vec<u8>,
    pub(crate) ram: Vec<u8>,
    pub(crate) ext_ram: Vec<u8>,
    pub sram: Sram,
    pub vdp: Vdp,
    pub tape: Tape,
    pub keyboard: Keyboard,
    pub printer: Printer,
    pub gun: LightGun,
    pub psg: Box<dyn Psg>,
    pub fm: Box<dyn FmUnit>,

    pub(crate) map: MemMap,
    /// Active bank switching scheme; None while detection is running
    pub mapper: Option<MapperKind>,
    pub(crate) mapper_attempts: u8,
    /// Mapper control/bank registers
    pub(crate) control: [u8; 16],
    pub(crate) bank_mask: u32,

    pub profile: Profile,
    pub hw: HwFlags,
    pub(crate) pal: bool,
    /// Controller port control register (TR/TH directions and levels)
    pub(crate) io_ctl: u8,
    /// SC-3000 PIA port C latch (matrix column, tape and printer lines)
    pub(crate) io_sg: u8,
    /// FM unit detection register
    pub(crate) fm_ctl: u8,
    /// Game Gear specific I/O registers
    pub(crate) io_gg: [u8; 8],
    /// Latched H counter
    pub(crate) vdp_hlatch: u8,
    /// Pad state, active high: bits 0-5 of pad 0 are up/down/left/right/1/2,
    /// bit 7 is pause/start; pad 1 continues in the upper lines
    pub pad: [u8; 2],

    /// Cycle at which the current scanline started
    pub(crate) line_start: i32,
    pub(crate) scanline: i32,

    pub(crate) config: Config,
}

impl SmsBus {
    pub fn new(config: Config) -> Self {
        Self {
            rom: Vec::new(),
            ram: vec![0; RAM_SIZE],
            ext_ram: vec![0; EXT_RAM_SIZE],
            sram: Sram {
                data: vec![0; SRAM_SIZE],
                changed: false,
            },
            vdp: Vdp::new(),
            tape: Tape::new(),
            keyboard: Keyboard::default(),
            printer: Printer::default(),
            gun: LightGun::default(),
            psg: Box::new(NullSound),
            fm: Box::new(NullSound),
            map: MemMap::new(),
            mapper: config.mapper,
            mapper_attempts: 0,
            control: [0; 16],
            bank_mask: 0,
            profile: config.profile.unwrap_or(Profile::Sms),
            hw: HwFlags::empty(),
            pal: config.pal,
            io_ctl: 0xff,
            io_sg: 0,
            fm_ctl: 0xff,
            io_gg: [0; 8],
            vdp_hlatch: 0,
            pad: [0; 2],
            line_start: 0,
            scanline: 0,
            config,
        }
    }

    /// Insert a cartridge image, padded up to the 8KB banking granularity
    pub fn load_rom(&mut self, mut rom: Vec<u8>) {
        let sz = rom.len().max(1).next_multiple_of(0x2000);
        rom.resize(sz, 0xff);
        self.rom = rom;
    }

    /// Cold boot: clear all volatile state and rebuild the memory map
    pub fn power_on(&mut self) {
        self.ram.fill(0);
        self.ext_ram.fill(0);
        self.vdp = Vdp::new();
        self.io_sg = 0;
        self.io_gg = [0; 8];
        self.vdp_hlatch = 0;
        self.hw = HwFlags::empty();
        self.bank_mask = mappers::bank_mask(self.rom.len() as u32);
        self.mapper = self.config.mapper;
        self.mapper_attempts = 0;
        self.reset();
    }

    /// Console reset: re-derive hardware flags from config and cartridge
    /// header, rebuild the memory map, apply VDP BIOS defaults.
    pub fn reset(&mut self) {
        let mut profile = self.config.profile.unwrap_or(Profile::Sms);
        self.mapper_attempts = 0;
        self.mapper = self.config.mapper;

        let mut hw = self.hw & HwFlags::FM_USED;
        if self.config.region != Region::Overseas {
            // default region Japan if no cartridge header
            hw |= HwFlags::JAPAN;
        }
        if self.config.enable_fm {
            hw |= HwFlags::FM;
        }
        if self.config.light_gun {
            hw |= HwFlags::LIGHT_GUN;
        }
        self.pal = self.config.pal;

        // check if the ROM header contains more system information
        if let Some(h) = header::probe(&self.rom) {
            if self.config.profile.is_none() && h.valid_id() && h.gg_cartridge() {
                profile = Profile::GameGear;
            }
            if self.config.region == Region::Auto {
                hw.remove(HwFlags::JAPAN);
                if h.japan() {
                    hw |= HwFlags::JAPAN;
                }
                if h.pal_only() {
                    self.pal = true; // requires 50Hz timing
                }
            }
            if h.gg_sms_mode() && self.config.profile.is_none() {
                profile = if h.hw < 0x5 {
                    Profile::GameGear
                } else {
                    Profile::Sms
                };
            }
            if h.no_fm() {
                hw.remove(HwFlags::FM); // incompatible with FM
            }
            if h.uses_3d_glasses() {
                hw |= HwFlags::GLASSES_3D;
            }
            // a trustworthy header means a standard Sega cartridge
            if self.mapper.is_none() && h.valid_id() {
                self.mapper = Some(MapperKind::Sega);
            }
        }
        self.profile = profile;
        self.hw = hw;

        self.io_ctl = if matches!(profile, Profile::Sg1000 | Profile::Sc3000) {
            0xf5
        } else {
            0xff
        };
        self.fm_ctl = 0xff;
        self.tape.close();

        self.setup_memory();
        self.vdp.reset_bios();

        // clear RAM (uninitialized on Mark-III, cf src/mame/drivers/sms.cpp)
        let fill = if profile != Profile::GameGear && self.hw.contains(HwFlags::JAPAN) {
            0xf0
        } else {
            0x00
        };
        self.ram.fill(fill);
    }

    /// Build the base memory map and the initial bank mapping
    pub(crate) fn setup_memory(&mut self) {
        self.map = MemMap::new();

        // RAM and its mirrors
        let sz = RAM_SIZE as u16;
        let mut a = 0xc000u16;
        loop {
            self.map.map_ram_read(a, a + (sz - 1), 0);
            self.map.map_ram_write(a, a + (sz - 1), 0);
            if a as u32 + sz as u32 >= 0x10000 {
                break;
            }
            a += sz;
        }
        // mapper detection at the top RAM mirror
        self.map.map_mapper_write(0xe000, 0xffff);

        // ROM
        self.map.map_rom_read(0x0000, 0xbfff, 0);
        self.map.map_mapper_write(0x0000, 0xbfff); // mapper detection

        self.init_banks();
    }

    pub fn sram_changed(&self) -> bool {
        self.sram.changed
    }

    /// Write as if from the CPU, for code outside the CPU loop
    pub(crate) fn write_mem(&mut self, a: u16, d: u8) {
        self.write(a, d, CpuView { pc: 0, cycles: 0 });
    }
}

impl BusZ80 for SmsBus {
    fn read(&self, a: u16) -> u8 {
        match self.map.read[(a >> PAGE_SHIFT) as usize] {
            ReadTarget::Rom(base) => {
                let off = base as usize + (a & PAGE_MASK) as usize;
                self.rom.get(off).copied().unwrap_or(0xff)
            }
            ReadTarget::Ram(base) => self.ram[(base + (a & PAGE_MASK)) as usize],
            ReadTarget::Ext(base) => self.ext_ram[(base + (a & PAGE_MASK)) as usize],
            ReadTarget::Sram(base) => {
                self.sram.data[base as usize + (a & PAGE_MASK) as usize]
            }
            ReadTarget::Janggun => {
                let bank = self.control[(a >> 13) as usize] as usize;
                let off = (bank << 13) + (a & 0x1fff) as usize;
                mappers::flip_byte(self.rom.get(off).copied().unwrap_or(0xff))
            }
            ReadTarget::Open => 0xff,
        }
    }

    fn write(&mut self, a: u16, d: u8, cpu: CpuView) {
        match self.map.write[(a >> PAGE_SHIFT) as usize] {
            WriteTarget::Ram(base) => self.ram[(base + (a & PAGE_MASK)) as usize] = d,
            WriteTarget::Ext(base) => self.ext_ram[(base + (a & PAGE_MASK)) as usize] = d,
            WriteTarget::SramBank => {
                // SRAM is mapped in 2 16KB banks, selected by bit 2 in the
                // control reg
                let off = (a & 0x3fff) as usize
                    + ((self.control[0x0c] & 0x04) >> 2) as usize * 0x4000;
                self.sram.changed |= self.sram.data[off] != d;
                self.sram.data[off] = d;
            }
            WriteTarget::Mapper => self.xwrite(a, d, cpu.pc),
            WriteTarget::Ignore => {}
        }
    }

    fn io_read(&mut self, port: u16, cpu: CpuView) -> u8 {
        let a = port & 0xff;
        let mut d = 0xff;
        log::trace!("z80 port {a:04x} read");

        if a >= 0xf0 {
            if self.hw.contains(HwFlags::FM) && a == 0xf2 {
                // bit 0 = 1 active FM Pac
                d = 0xf8 | self.fm_ctl;
            }
        } else {
            match a & 0xc1 {
                0x00 | 0x01 => {
                    if self.profile == Profile::GameGear && a < 0x8 {
                        // GG I/O area
                        d = match a {
                            0 => {
                                (!self.pad[0] & 0x80)
                                    | ((!self.hw.contains(HwFlags::JAPAN) as u8) << 6)
                            }
                            1 => self.io_gg[1] | (self.io_gg[2] & 0x7f),
                            5 => self.io_gg[5] & 0xf8,
                            _ => self.io_gg[a as usize],
                        };
                    }
                }

                0x40 => {
                    // V counter
                    d = self.vdp.v_counter;
                }

                0x41 => {
                    // H counter
                    d = self.vdp_hlatch;
                }

                0x80 => d = self.vdp.data_read(),
                0x81 => d = self.vdp.ctl_read(),

                0xc0 => {
                    // I/O port A and B
                    // For SC-3000: PIA port A, assume always configured for
                    // input
                    if self.profile != Profile::Sc3000 || self.io_sg & 7 == 7 {
                        d = !((self.pad[0] & 0x3f) | (self.pad[1] << 6));
                        if self.io_ctl & 0x01 == 0 {
                            // TR as output
                            d = (d & !0x20) | ((self.io_ctl << 1) & 0x20);
                        }
                    } else {
                        d = self.keyboard.scan(self.io_sg & 7, 0..8);
                    }
                }

                0xc1 => {
                    // I/O port B and miscellaneous
                    // For SC-3000: PIA port B, assume always configured for
                    // input
                    if self.profile != Profile::Sc3000 || self.io_sg & 7 == 7 {
                        d = (self.io_ctl & 0x80) | ((self.io_ctl << 1) & 0x40) | 0x30;
                        d |= !(self.pad[1] >> 2) & 0x0f;
                        if self.io_ctl & 0x04 == 0 {
                            // TR as output
                            d = (d & !0x08) | ((self.io_ctl >> 3) & 0x08);
                        }
                        if self.io_ctl & 0x08 != 0 {
                            d |= 0x80; // TH as input is unconnected
                        }
                        if self.io_ctl & 0x02 != 0 {
                            d |= 0x40;
                        }
                        if self.hw.contains(HwFlags::LIGHT_GUN) {
                            let x = Vdp::hcounter(cpu.cycles - self.line_start) as i32;
                            let th = 0xc0;
                            d |= th; // TH input, high if no light detected
                            if let Some(latch) = self.gun.sense(2 * x, self.scanline) {
                                d &= !th; // TH falling, save hcounter
                                self.vdp_hlatch = latch;
                            }
                        }
                    } else {
                        d = 0xf0 | self.keyboard.scan(self.io_sg & 7, 8..12);
                        // bit 5 = printer fault, bit 6 = printer busy;
                        // clear so that BASIC thinks a printer is connected
                        d &= !0x60;
                    }
                    if self.profile == Profile::Sc3000 {
                        // bit 7 = tape input
                        d &= !0x80;
                        d |= (self.tape.update(cpu.cycles) as u8) << 7;
                    }
                }

                _ => {}
            }
        }
        d
    }

    fn io_write(&mut self, port: u16, d: u8, cpu: CpuView) {
        let a = port & 0xff;
        log::trace!("z80 port {a:04x} write {d:02x}");

        if a >= 0xf0 {
            if self.hw.contains(HwFlags::FM) {
                match a {
                    0xf0 => {
                        // FM reg port
                        self.hw |= HwFlags::FM_USED;
                        self.fm.reg_write(d);
                    }
                    0xf1 => self.fm.data_write(d),
                    0xf2 => self.fm_ctl = d & 0x1,
                    _ => {}
                }
            }
        } else {
            match a & 0xc1 {
                0x00 => {
                    if self.profile == Profile::GameGear && a < 0x8 {
                        // GG I/O area
                        self.io_gg[a as usize] = d;
                        if a == 0x6 {
                            self.psg.stereo_write(d);
                        }
                    }
                }
                0x01 => {
                    if self.profile == Profile::GameGear && a < 0x8 {
                        self.io_gg[a as usize] = d;
                    } else {
                        // pad. latch hcounter if one of the TH lines is
                        // switched to 1
                        if (self.io_ctl ^ d) & d & 0xa0 != 0 {
                            self.vdp_hlatch = Vdp::hcounter(cpu.cycles - self.line_start);
                        }
                        self.io_ctl = d;
                    }
                }

                0x40 | 0x41 => {
                    self.psg.flush_to(cpu.cycles);
                    self.psg.write(d);
                }

                0x80 => {
                    let gg = self.profile == Profile::GameGear;
                    self.vdp.data_write(gg, d);
                }
                0x81 => self.vdp.ctl_write(d, cpu.cycles - self.line_start),

                0xc0 => {
                    if self.profile == Profile::Sc3000 && a & 0x2 != 0 {
                        // PIA port C, assume always configured for output
                        self.io_sg = d; // 0xc2 = kbd/pad matrix column select
                        // bit 4 = tape output
                        // bit 5 = printer data
                        // bit 6 = printer reset
                        // bit 7 = printer feed
                    }
                }
                0xc1 => {
                    if self.profile == Profile::Sc3000 && a & 0x2 != 0 && d & 0x80 == 0 {
                        // PIA control port. BSR mode used for printer and
                        // tape.
                        let b = (d >> 1) & 0x7;
                        self.io_sg &= !(1 << b);
                        self.io_sg |= (d & 1) << b;

                        match b {
                            4 => self.tape.write(cpu.cycles, Some(d & 1 != 0)),
                            5 => self.printer.data(d & 1 != 0),
                            6 => self.printer.reset(d & 1 != 0),
                            _ => {}
                        }
                    }
                }

                _ => {}
            }
        }
    }

    fn irq_level(&self) -> bool {
        self.vdp.irq
    }
}
