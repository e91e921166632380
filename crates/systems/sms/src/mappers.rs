//! ROM/SRAM bank mapping, see https://www.smspower.org/Development/Mappers
//!
//! Cartridges carry one of a dozen bank switching schemes, selected by
//! writes to scheme-specific magic addresses. Unless a scheme is forced by
//! configuration, it is detected at run time: every write reaching ROM
//! address space or the top of RAM is offered to each candidate scheme in a
//! fixed order, and the first one whose preconditions match claims the
//! cartridge. Detection stops after 50 attempts.

use crate::bus::SmsBus;
use crate::Profile;
use serde::{Deserialize, Serialize};

/// Cartridge bank switching scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapperKind {
    /// Sega mapper. Maps 3 banks 16KB each, with SRAM support
    Sega,
    /// Codemasters mapper. Similar to Sega, but different addresses
    Codemasters,
    /// Korea mapping, 1 selectable 16KB bank at the top
    Korea,
    /// MSX mapper. 4 selectable 8KB banks at the top
    KoreaMsx,
    /// Korean n-in-1 mapping. 1 selectable 32KB bank at the bottom
    KoreaXin1,
    /// Korean 4-in-1. 2 selectable 16KB banks, top bank shifted by bottom
    Korea4Pak,
    /// Korean Janggun mapper. 4 selectable 8KB banks, hardware byte flip
    KoreaJanggun,
    /// MSX-Nemesis mapper. As MSX plus a fixed bank at address 0
    KoreaNemesis,
    /// SG-1000 8KB RAM Adaptor. 8KB RAM at address 0x2000
    Taiwan8KRam,
    /// Korean 188-in-1. 4 8KB banks from 0x4000, xor'd bank index
    KoreaXor,
    /// SC-3000 32KB RAM for BASIC level IIIB. 32KB RAM at address 0x8000
    Sega32KRam,
}

impl MapperKind {
    pub fn name(&self) -> &'static str {
        match self {
            MapperKind::Sega => "Sega",
            MapperKind::Codemasters => "Codemasters",
            MapperKind::Korea => "Korea",
            MapperKind::KoreaMsx => "Korea MSX",
            MapperKind::KoreaXin1 => "Korea X-in-1",
            MapperKind::Korea4Pak => "Korea 4-Pak",
            MapperKind::KoreaJanggun => "Korea Janggun",
            MapperKind::KoreaNemesis => "Korea Nemesis",
            MapperKind::Taiwan8KRam => "Taiwan 8K RAM",
            MapperKind::KoreaXor => "Korea XOR",
            MapperKind::Sega32KRam => "Sega 32K RAM",
        }
    }
}

/// Mask applied to bank numbers, derived from the padded ROM size
pub(crate) fn bank_mask(romsize: u32) -> u32 {
    let mut s = 0;
    let mut tmp = romsize;
    loop {
        tmp >>= 1;
        if tmp == 0 {
            break;
        }
        s += 1;
    }
    if romsize > (1 << s) {
        s += 1;
    }
    ((1u32 << s) - 1) >> 14
}

/// Reversed nibble bit order
static FLIPPER: [u8; 16] = [
    0x0, 0x8, 0x4, 0xc, 0x2, 0xa, 0x6, 0xe, 0x1, 0x9, 0x5, 0xd, 0x3, 0xb, 0x7, 0xf,
];

/// Byte with reversed bit order, for the Janggun flipped banks
pub(crate) fn flip_byte(c: u8) -> u8 {
    (FLIPPER[(c & 0xf) as usize] << 4) | FLIPPER[(c >> 4) as usize]
}

// TODO auto-selecting is not really reliable.
// Before adding more mappers this should be revised.
impl SmsBus {
    /// Write falling through to cartridge address space or the top of RAM.
    /// Feeds the active bank switching scheme, or detection if none is
    /// active yet.
    pub(crate) fn xwrite(&mut self, a: u16, d: u8, pc: u16) {
        log::trace!("z80 write [{a:04x}] {d:02x}");
        if a >= 0xc000 {
            let sz = self.ram.len();
            self.ram[a as usize & (sz - 1)] = d;
        }

        match self.mapper {
            Some(MapperKind::Sega) => self.bank_sega(a, d, pc),
            Some(MapperKind::Codemasters) => self.bank_codem(a, d, pc),
            Some(MapperKind::KoreaMsx) => self.bank_msx(a, d, pc),
            Some(MapperKind::Korea) => self.bank_korea(a, d, pc),
            Some(MapperKind::KoreaXin1) => self.bank_n32k(a, d, pc),
            Some(MapperKind::Korea4Pak) => self.bank_n16k(a, d, pc),
            Some(MapperKind::KoreaJanggun) => self.bank_jang(a, d, pc),
            Some(MapperKind::KoreaNemesis) => self.bank_msxn(a, d, pc),
            Some(MapperKind::Taiwan8KRam) => self.bank_x8k(a, d, pc),
            Some(MapperKind::Sega32KRam) => self.bank_x32k(a, d, pc),
            Some(MapperKind::KoreaXor) => self.bank_xor(a, d, pc),

            None => {
                // disable autodetection after some time
                if (0xc000..0xfff8).contains(&a) || self.mapper_attempts > 50 {
                    return;
                }
                // NB the sequence of schemes is crucial for the detection
                match self.profile {
                    Profile::Sc3000 => self.bank_x32k(a, d, pc),
                    Profile::Sg1000 => self.bank_x8k(a, d, pc),
                    _ => {
                        self.bank_n32k(a, d, pc);
                        self.bank_sega(a, d, pc);
                        self.bank_msx(a, d, pc);
                        self.bank_codem(a, d, pc);
                        self.bank_korea(a, d, pc);
                        self.bank_n16k(a, d, pc);
                        self.bank_xor(a, d, pc);
                    }
                }

                self.mapper_attempts += 1;
                if let Some(m) = self.mapper {
                    log::info!("autodetected {} mapper", m.name());
                }
            }
        }
    }

    fn bank_sega(&mut self, a: u16, d: u8, pc: u16) {
        if a < 0xfff8 {
            return;
        }
        // avoid mapper detection for RAM fill with 0
        if self.mapper != Some(MapperKind::Sega) && (self.mapper.is_some() || d == 0) {
            return;
        }

        log::trace!("bank sega {a:04x} {d:02x} @ {pc:04x}");
        self.mapper = Some(MapperKind::Sega);
        let r = (a & 0x0f) as usize;
        if d == self.control[r] {
            return;
        }
        self.control[r] = d;

        match r {
            0x0d => {
                let b = d as u32 & self.bank_mask;
                self.map.map_rom_read(0x0400, 0x3fff, 0x400 + (b << 14));
            }
            0x0e => {
                let b = d as u32 & self.bank_mask;
                self.map.map_rom_read(0x4000, 0x7fff, b << 14);
            }
            0x0c | 0x0f => {
                if r == 0x0c && d & !0x8c != 0 {
                    log::warn!("{d:02x} written to control reg!");
                }
                if self.control[0x0c] & 0x08 != 0 {
                    let b = ((self.control[0x0c] & 0x04) >> 2) as u32;
                    self.map.map_sram_read(0x8000, 0xbfff, b * 0x4000);
                    self.map.map_sram_bank_write(0x8000, 0xbfff);
                } else {
                    let b = self.control[0x0f] as u32 & self.bank_mask;
                    self.map.map_rom_read(0x8000, 0xbfff, b << 14);
                    self.map.map_mapper_write(0x8000, 0xbfff);
                }
            }
            _ => {}
        }
    }

    fn bank_codem(&mut self, a: u16, d: u8, pc: u16) {
        if a >= 0xc000 || a & 0x3fff != 0 {
            // address is 0x0000, 0x4000, 0x8000?
            return;
        }
        // don't detect linear mapping to avoid confusing with MSX
        if self.mapper != Some(MapperKind::Codemasters)
            && (self.mapper.is_some() || (a >> 14) as u8 == d)
        {
            return;
        }
        log::trace!("bank codem {a:04x} {d:02x} @ {pc:04x}");
        self.mapper = Some(MapperKind::Codemasters);
        let r = (a >> 14) as usize;
        if self.control[r] == d {
            return;
        }
        self.control[r] = d;

        let b = d as u32 & self.bank_mask;
        self.map.map_rom_read(a, a + 0x3fff, b << 14);
        if self.control[1] & 0x80 != 0 {
            self.map.map_ext_read(0xa000, 0xbfff, 0);
            self.map.map_ext_write(0xa000, 0xbfff, 0);
        } else {
            let b = self.control[2] as u32 & self.bank_mask;
            self.map.map_rom_read(0xa000, 0xbfff, (b << 14) + 0x2000);
            self.map.map_mapper_write(0xa000, 0xbfff);
        }
    }

    fn bank_msx(&mut self, a: u16, d: u8, pc: u16) {
        if a > 0x0003 {
            return;
        }
        // don't detect linear mapping to avoid confusing with Codemasters
        if self.mapper != Some(MapperKind::KoreaMsx)
            && (self.mapper.is_some() || (a == 0 && d == 0) || d >= 0x80)
        {
            return;
        }
        log::trace!("bank msx {a:04x} {d:02x} @ {pc:04x}");
        self.mapper = Some(MapperKind::KoreaMsx);
        self.control[a as usize] = d;

        let at = (a ^ 2) * 0x2000 + 0x4000;
        let b = d as u32 & (2 * self.bank_mask + 1);
        self.map.map_rom_read(at, at + 0x1fff, b << 13);
    }

    fn bank_korea(&mut self, a: u16, d: u8, pc: u16) {
        if a != 0xa000 {
            return;
        }
        if self.mapper != Some(MapperKind::Korea) && self.mapper.is_some() {
            return;
        }
        log::trace!("bank korea {a:04x} {d:02x} @ {pc:04x}");
        self.mapper = Some(MapperKind::Korea);
        self.control[0x0f] = d;

        let b = d as u32 & self.bank_mask;
        self.map.map_rom_read(0x8000, 0xbfff, b << 14);
    }

    fn bank_n32k(&mut self, a: u16, d: u8, pc: u16) {
        if a != 0xffff {
            return;
        }
        // code must be in RAM since all visible ROM space is swapped
        if self.mapper != Some(MapperKind::KoreaXin1) && (self.mapper.is_some() || pc < 0xc000) {
            return;
        }
        log::trace!("bank 32k {a:04x} {d:02x} @ {pc:04x}");
        self.mapper = Some(MapperKind::KoreaXin1);
        self.control[0x0f] = d;

        let b = d as u32 & (self.bank_mask >> 1);
        self.map.map_rom_read(0, 0x7fff, b << 15);
    }

    fn bank_n16k(&mut self, a: u16, d: u8, pc: u16) {
        if a != 0x3ffe && a != 0x7fff && a != 0xbfff {
            return;
        }
        // code must be in RAM since all visible ROM space is swapped
        if self.mapper != Some(MapperKind::Korea4Pak) && (self.mapper.is_some() || pc < 0xc000) {
            return;
        }
        log::trace!("bank 16k {a:04x} {d:02x} @ {pc:04x}");
        self.mapper = Some(MapperKind::Korea4Pak);
        self.control[(a >> 14) as usize] = d;

        let mut b = d as u32 & self.bank_mask;
        let at = a & 0xc000;
        // the top bank shifts with the bottom bank.
        if at == 0x8000 {
            b += (self.control[0] & 0x30) as u32;
        }
        self.map.map_rom_read(at, at + 0x3fff, b << 14);
    }

    fn bank_msxn(&mut self, a: u16, d: u8, pc: u16) {
        if a > 0x0003 {
            return;
        }
        // never autodetected, selectable only via config
        if self.mapper != Some(MapperKind::KoreaNemesis) {
            return;
        }
        log::trace!("bank nems {a:04x} {d:02x} @ {pc:04x}");
        self.control[a as usize] = d;

        let at = (a ^ 2) * 0x2000 + 0x4000;
        let b = d as u32 & (2 * self.bank_mask + 1);
        self.map.map_rom_read(at, at + 0x1fff, b << 13);
    }

    fn bank_jang(&mut self, a: u16, d: u8, pc: u16) {
        // address is 0xfffe, 0xffff, 0x4000, 0x6000, 0x8000, 0xa000
        if (a | 1) != 0xffff && (!(0x4000..=0xa000).contains(&a) || a & 0x1fff != 0) {
            return;
        }
        // never autodetected, selectable only via config
        if self.mapper != Some(MapperKind::KoreaJanggun) {
            return;
        }
        log::trace!("bank jang {a:04x} {d:02x} @ {pc:04x}");

        if (a | 1) == 0xffff {
            let x = (a & 1) as usize;
            let flip = d & 0x40 != 0;
            self.control[x] = d;
            let b = d as u32 & self.bank_mask;
            self.control[2 * x + 2] = (2 * b) as u8;
            self.control[2 * x + 3] = (2 * b + 1) as u8;
            let at = ((x as u16) + 1) * 0x4000;
            if !flip {
                self.map.map_rom_read(at, at + 0x3fff, b << 14);
            } else {
                self.map.map_janggun_read(at, at + 0x3fff);
            }
        } else {
            let b = d as u32 & (2 * self.bank_mask + 1);
            self.control[(a >> 13) as usize] = b as u8;
            if self.control[((a >> 15) & 1) as usize] & 0x40 == 0 {
                self.map.map_rom_read(a, a + 0x1fff, b << 13);
            } else {
                self.map.map_janggun_read(a, a + 0x1fff);
            }
        }
    }

    fn bank_xor(&mut self, a: u16, d: u8, pc: u16) {
        // 4x8KB bank select @0x2000
        if a & 0xff00 != 0x2000 {
            return;
        }
        if self.mapper != Some(MapperKind::KoreaXor) && self.mapper.is_some() {
            return;
        }
        log::trace!("bank xor {a:04x} {d:02x} @ {pc:04x}");
        self.mapper = Some(MapperKind::KoreaXor);

        self.control[0] = d;
        let d = d as u32;
        self.map.map_rom_read(0x4000, 0x5fff, (d ^ 0x1f) << 13);
        self.map.map_rom_read(0x6000, 0x7fff, (d ^ 0x1e) << 13);
        self.map.map_rom_read(0x8000, 0x9fff, (d ^ 0x1d) << 13);
        self.map.map_rom_read(0xa000, 0xbfff, (d ^ 0x1c) << 13);
    }

    fn bank_x8k(&mut self, a: u16, d: u8, pc: u16) {
        // 8KB address range @ 0x2000 (adaptor) or @ 0x8000 (cartridge)
        if (a & 0xe000 != 0x2000 && a & 0xe000 != 0x8000) || a & 0x0f == 5 {
            return;
        }
        if self.mapper != Some(MapperKind::Taiwan8KRam) && self.mapper.is_some() {
            return;
        }

        log::trace!("bank x8k {a:04x} {d:02x} @ {pc:04x}");
        self.ext_ram[(a & 0x1fff) as usize] = d;
        self.mapper = Some(MapperKind::Taiwan8KRam);

        let at = a & 0xe000;
        self.control[0] = (at >> 12) as u8;
        self.map.map_ext_read(at, at + 0x1fff, 0);
        self.map.map_ext_write(at, at + 0x1fff, 0);
    }

    fn bank_x32k(&mut self, a: u16, d: u8, pc: u16) {
        // 32KB address range @ 0x8000
        if a & 0xc000 != 0x8000 {
            return;
        }
        if self.mapper != Some(MapperKind::Sega32KRam)
            && (self.mapper.is_some() || self.rom.len() > 0x8000)
        {
            return;
        }

        log::trace!("bank x32k {a:04x} {d:02x} @ {pc:04x}");
        self.ext_ram[(a & 0x7fff) as usize] = d;
        self.mapper = Some(MapperKind::Sega32KRam);

        let at = a & 0xc000;
        self.control[0] = (at >> 12) as u8;
        // NB this deactivates internal RAM and all mapper detection
        self.ext_ram[0x6000..0x8000].copy_from_slice(&self.ram[0..0x2000]);
        self.map.map_ext_read(at, at | 0x7fff, 0);
        self.map.map_ext_write(at, at | 0x7fff, 0);
    }

    /// Replay the active scheme's bank registers after a state load, so the
    /// memory map matches the restored registers.
    pub(crate) fn state_loaded(&mut self) {
        // xwrite also writes through to RAM; preserve the affected bytes
        let mut ram_top = [0u8; 16];
        ram_top.copy_from_slice(&self.ram[0x1ff0..0x2000]);
        let control = self.control;
        self.control = [0xff; 16];

        match self.mapper {
            Some(MapperKind::Taiwan8KRam) | Some(MapperKind::Sega32KRam) => {
                let a = (control[0] as u16) << 12;
                self.xwrite(a, self.ext_ram[0], 0);
            }
            Some(MapperKind::KoreaMsx) | Some(MapperKind::KoreaNemesis) => {
                self.xwrite(0x0000, control[0], 0);
                self.xwrite(0x0001, control[1], 0);
                self.xwrite(0x0002, control[2], 0);
                self.xwrite(0x0003, control[3], 0);
            }
            Some(MapperKind::Korea) => {
                self.xwrite(0xa000, control[0x0f], 0);
            }
            Some(MapperKind::KoreaXin1) => {
                self.xwrite(0xffff, control[0x0f], 0);
            }
            Some(MapperKind::Korea4Pak) => {
                self.xwrite(0x3ffe, control[0], 0);
                self.xwrite(0x7fff, control[1], 0);
                self.xwrite(0xbfff, control[2], 0);
            }
            Some(MapperKind::KoreaJanggun) => {
                self.xwrite(0x4000, control[2], 0);
                self.xwrite(0x6000, control[3], 0);
                self.xwrite(0x8000, control[4], 0);
                self.xwrite(0xa000, control[5], 0);
            }
            Some(MapperKind::KoreaXor) => {
                self.xwrite(0x2000, control[0], 0);
            }
            Some(MapperKind::Codemasters) => {
                self.xwrite(0x0000, control[0], 0);
                self.xwrite(0x4000, control[1], 0);
                self.xwrite(0x8000, control[2], 0);
            }
            Some(MapperKind::Sega) => {
                self.xwrite(0xfffc, control[0x0c], 0);
                self.xwrite(0xfffd, control[0x0d], 0);
                self.xwrite(0xfffe, control[0x0e], 0);
                self.xwrite(0xffff, control[0x0f], 0);
            }
            _ => {}
        }

        self.ram[0x1ff0..0x2000].copy_from_slice(&ram_top);
        self.control = control;
    }

    /// Set up the initial linear bank mapping for a preselected scheme
    pub(crate) fn init_banks(&mut self) {
        let mut mapper = self.mapper;
        // SC-3000 has 2KB, but no harm in mapping the 32KB for BASIC here
        if self.profile == Profile::Sc3000 && mapper.is_none() {
            mapper = Some(MapperKind::Sega32KRam);
        }
        // Nemesis mapper maps last 8KB rom bank #15 to address 0
        if mapper == Some(MapperKind::KoreaNemesis) && self.rom.len() > 0x1e000 {
            self.map.map_rom_read(0x0000, 0x1fff, 0x1e000);
        }

        self.control = [0; 16];
        match mapper {
            Some(MapperKind::KoreaMsx) | Some(MapperKind::KoreaNemesis) => {
                self.xwrite(0x0000, 4, 0);
                self.xwrite(0x0001, 5, 0);
                self.xwrite(0x0002, 2, 0);
                self.xwrite(0x0003, 3, 0);
            }
            Some(MapperKind::Korea) => {
                self.xwrite(0xa000, 2, 0);
            }
            Some(MapperKind::KoreaXin1) => {
                self.xwrite(0xffff, 0, 0);
            }
            Some(MapperKind::Korea4Pak) => {
                self.xwrite(0x3ffe, 0, 0);
                self.xwrite(0x7fff, 1, 0);
                self.xwrite(0xbfff, 2, 0);
            }
            Some(MapperKind::KoreaJanggun) => {
                self.xwrite(0xfffe, 1, 0);
                self.xwrite(0xffff, 2, 0);
            }
            Some(MapperKind::KoreaXor) => {
                self.xwrite(0x2000, 0, 0);
            }
            Some(MapperKind::Codemasters) => {
                self.xwrite(0x0000, 0, 0);
                self.xwrite(0x4000, 1, 0);
                self.xwrite(0x8000, 2, 0);
            }
            Some(MapperKind::Sega) => {
                self.xwrite(0xfffc, 0, 0);
                self.xwrite(0xfffd, 0, 0);
                self.xwrite(0xfffe, 1, 0);
                self.xwrite(0xffff, 2, 0);
            }
            Some(MapperKind::Sega32KRam) => {
                self.xwrite(0x8000, 0, 0);
            }
            None => {
                // pre-initialize Sega scheme to linear mapping (else state
                // load may fail)
                self.control[0x0e] = 0x1;
                self.control[0x0f] = 0x2;
            }
            _ => {}
        }
    }
}
