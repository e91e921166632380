//! Sega 8-bit console core: Master System, Game Gear, SG-1000 and SC-3000.
//!
//! All four machines share the same Z80 bus layout and differ in video
//! mode support, I/O ports and peripherals; one machine record covers them
//! all, selected by [`Profile`]. The frame sequencer drives the CPU line by
//! line (228 Z80 cycles per line, 262 lines NTSC / 313 PAL) and implements
//! the VDP interrupt protocol, leaving pixel generation to a pluggable
//! [`Renderer`].
//!
//! Cartridge bank switching schemes are detected at run time unless forced
//! by [`Config`]; see the `mappers` module.

pub mod bus;
mod fixed;
pub mod header;
pub mod io;
pub mod mappers;
pub mod tape;
pub mod vdp;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

use sega8_core::cpu_z80::CpuZ80;
use sega8_core::System;

pub use bus::SmsBus;
pub use io::{FmUnit, Key, Keyboard, LightGun, Psg};
pub use mappers::MapperKind;
pub use tape::{Tape, TapeFormat};
pub use vdp::{NullRenderer, Renderer, Vdp, CYCLES_PER_LINE};

bitflags! {
    /// Hardware traits resolved at reset from config and cartridge header
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HwFlags: u32 {
        /// Japanese region console
        const JAPAN = 0x01;
        /// FM sound unit present
        const FM = 0x02;
        /// Software has touched the FM unit this session
        const FM_USED = 0x04;
        /// Cartridge uses the 3-D glasses
        const GLASSES_3D = 0x08;
        /// Light phaser plugged in
        const LIGHT_GUN = 0x10;
    }
}

/// Console variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Profile {
    Sms,
    GameGear,
    Sg1000,
    Sc3000,
}

/// Region selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Region {
    /// Japan unless the cartridge header says otherwise
    #[default]
    Auto,
    Japan,
    Overseas,
}

/// Machine configuration, applied at reset
#[derive(Debug, Clone)]
pub struct Config {
    /// Console variant; None detects Game Gear cartridges by header
    pub profile: Option<Profile>,
    /// Bank switching scheme; None runs autodetection
    pub mapper: Option<MapperKind>,
    pub region: Region,
    /// 50Hz timing; also forced by the header database when region is Auto
    pub pal: bool,
    pub enable_fm: bool,
    pub light_gun: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile: None,
            mapper: None,
            region: Region::Auto,
            pal: false,
            enable_fm: true,
            light_gun: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SmsError {
    #[error("no cartridge loaded")]
    NoRom,
    #[error("tape: {0}")]
    Tape(#[from] std::io::Error),
}

/// Lines per frame
fn frame_lines(pal: bool) -> i32 {
    if pal {
        313
    } else {
        262
    }
}

/// Number of visible lines selected by the VDP mode registers
fn visible_lines(regs: &[u8; 16]) -> i32 {
    if regs[0] & 6 == 6 && regs[1] & 0x18 != 0 {
        if regs[1] & 0x08 != 0 {
            240
        } else {
            224
        }
    } else {
        192
    }
}

/// Externally visible V counter for a line. It is set back at some point in
/// the VBLANK so that the line count in the active area (-32..lines+1) is
/// contiguous.
fn v_counter_for_line(y: i32, lines: i32, lines_vis: i32, pal: bool) -> u8 {
    let wrap_after = match (pal, lines_vis) {
        (false, 192) => 218,
        (false, 224) => 234,
        (true, 192) => 242,
        (true, 224) => 258,
        (true, 240) => 266,
        _ => lines, // no rollover documented
    };
    if y > wrap_after {
        (y - (lines - 256)) as u8
    } else {
        y as u8
    }
}

/// A complete console with CPU, bus and renderer
pub struct SmsSystem {
    pub cpu: CpuZ80<SmsBus>,
    renderer: Box<dyn Renderer>,
    nmi_state: bool,
    /// Skip pixel generation for frames nobody will see
    pub skip_render: bool,
}

impl SmsSystem {
    pub fn new(config: Config) -> Self {
        Self {
            cpu: CpuZ80::new(SmsBus::new(config)),
            renderer: Box::new(NullRenderer),
            nmi_state: false,
            skip_render: false,
        }
    }

    pub fn set_renderer(&mut self, renderer: Box<dyn Renderer>) {
        self.renderer = renderer;
    }

    /// Insert a cartridge and cold boot
    pub fn load_rom(&mut self, rom: Vec<u8>) {
        self.cpu.bus.load_rom(rom);
        self.power_on();
    }

    pub fn power_on(&mut self) {
        self.cpu.bus.power_on();
        self.cpu.reset();
        self.nmi_state = false;
    }

    pub fn bus(&self) -> &SmsBus {
        &self.cpu.bus
    }

    pub fn bus_mut(&mut self) -> &mut SmsBus {
        &mut self.cpu.bus
    }

    /// Start playing a tape image (SC-3000)
    pub fn play_tape(&mut self, path: &Path) -> Result<(), SmsError> {
        let pal = self.cpu.bus.pal;
        let now = self.cpu.cycles;
        Ok(self.cpu.bus.tape.play_file(path, pal, now)?)
    }

    /// Start recording a tape image (SC-3000)
    pub fn record_tape(&mut self, path: &Path) -> Result<(), SmsError> {
        let pal = self.cpu.bus.pal;
        let now = self.cpu.cycles;
        Ok(self.cpu.bus.tape.record_file(path, pal, now)?)
    }

    pub fn close_tape(&mut self) {
        self.cpu.bus.tape.close();
    }

    /// Run one frame of emulation
    pub fn run_frame(&mut self) {
        let skip = self.skip_render;
        let pal = self.cpu.bus.pal;
        let lines = frame_lines(pal);

        // the pause button generates an NMI on the SMS; not on GG
        let nmi = self.cpu.bus.pad[0] & 0x80 != 0;
        if self.cpu.bus.profile == Profile::Sms && !self.nmi_state && nmi {
            self.cpu.nmi();
        }
        self.nmi_state = nmi;

        let lines_vis = visible_lines(&self.cpu.bus.vdp.regs);
        self.renderer.frame_start(&self.cpu.bus.vdp, lines_vis as u16);
        let mut hint = self.cpu.bus.vdp.regs[0x0a] as i32;

        for y in 0..lines {
            let line_start = y * CYCLES_PER_LINE;
            self.cpu.bus.line_start = line_start;
            self.cpu.bus.scanline = y;
            self.cpu.bus.vdp.v_counter = v_counter_for_line(y, lines, lines_vis, pal);

            // parse sprites for the next line
            if y < lines_vis {
                self.renderer.scan_sprites(&mut self.cpu.bus.vdp, y - 1);
            } else if y > lines - 32 {
                self.renderer.scan_sprites(&mut self.cpu.bus.vdp, y - 1 - lines);
            }

            // take over status bits from previously rendered line
            // TODO: cycle exact?
            let vdp = &mut self.cpu.bus.vdp;
            vdp.status |= vdp.sprites_status;
            vdp.sprites_status = 0;

            // Interrupt handling. Simulate interrupt flagged and immediately
            // reset in the same insn by flagging the irq, executing for 1
            // insn, then checking if the irq is still pending. (GG Chicago,
            // SMS Back to the Future III)
            vdp.pending_ints &= !2; // lost if not caught in the same line
            if y <= lines_vis {
                hint -= 1;
                if hint < 0 {
                    hint = self.cpu.bus.vdp.regs[0x0a] as i32;
                    self.cpu.bus.vdp.pending_ints |= 2;
                    let cnt = self.cpu.cycles;
                    self.cpu.run_to(cnt + 1);

                    let vdp = &mut self.cpu.bus.vdp;
                    if vdp.regs[0] & 0x10 != 0 && vdp.pending_ints & 2 != 0 {
                        log::trace!("hint");
                        vdp.irq = true;
                    }
                }
            } else if y == lines_vis + 1 {
                self.cpu.bus.vdp.pending_ints |= 1;
                let cnt = self.cpu.cycles;
                self.cpu.run_to(cnt + 1);

                let vdp = &mut self.cpu.bus.vdp;
                if vdp.regs[1] & 0x20 != 0 && vdp.pending_ints & 1 != 0 {
                    log::trace!("vint");
                    vdp.irq = true;
                }
            }
            // display off after line start (GG Madou 1)
            self.cpu.run_to(line_start + 12);

            // render next line
            if y < lines_vis && !skip {
                self.renderer.render_line(&self.cpu.bus.vdp, y as u16);
            }

            self.cpu.run_to(line_start + CYCLES_PER_LINE);
        }

        // end of frame updates
        self.cpu.bus.tape.frame_end(lines * CYCLES_PER_LINE);
        self.cpu.reset_cycles();
    }

    /// Redraw the current frame without running the CPU
    pub fn draw_frame(&mut self) {
        let lines_vis = visible_lines(&self.cpu.bus.vdp.regs);
        self.renderer.frame_start(&self.cpu.bus.vdp, lines_vis as u16);
        for y in 0..lines_vis {
            self.renderer.scan_sprites(&mut self.cpu.bus.vdp, y - 1);
            self.renderer.render_line(&self.cpu.bus.vdp, y as u16);
        }
    }
}

/// CPU registers in saved states
#[derive(Debug, Serialize, Deserialize)]
struct CpuState {
    a: u8,
    f: u8,
    b: u8,
    c: u8,
    d: u8,
    e: u8,
    h: u8,
    l: u8,
    a_prime: u8,
    f_prime: u8,
    b_prime: u8,
    c_prime: u8,
    d_prime: u8,
    e_prime: u8,
    h_prime: u8,
    l_prime: u8,
    ix: u16,
    iy: u16,
    i: u8,
    r: u8,
    sp: u16,
    pc: u16,
    iff1: bool,
    iff2: bool,
    im: u8,
    halted: bool,
    cycles: i32,
}

/// Machine state in saved states; the memory map is rebuilt on load
#[derive(Debug, Serialize, Deserialize)]
struct MachineState {
    ram: Vec<u8>,
    ext_ram: Vec<u8>,
    sram: bus::Sram,
    vdp: Vdp,
    mapper: Option<MapperKind>,
    mapper_attempts: u8,
    control: Vec<u8>,
    profile: Profile,
    hw: u32,
    pal: bool,
    io_ctl: u8,
    io_sg: u8,
    fm_ctl: u8,
    io_gg: Vec<u8>,
    vdp_hlatch: u8,
}

#[derive(Debug, Serialize, Deserialize)]
struct SmsState {
    cpu: CpuState,
    machine: MachineState,
    nmi_state: bool,
}

impl System for SmsSystem {
    type Error = SmsError;

    fn reset(&mut self) {
        self.cpu.bus.reset();
        self.cpu.reset();
        self.nmi_state = false;
    }

    fn step_frame(&mut self) -> Result<(), SmsError> {
        if self.cpu.bus.rom.is_empty() {
            return Err(SmsError::NoRom);
        }
        self.run_frame();
        Ok(())
    }

    fn save_state(&self) -> Value {
        let cpu = &self.cpu;
        let bus = &cpu.bus;
        let state = SmsState {
            cpu: CpuState {
                a: cpu.a,
                f: cpu.f,
                b: cpu.b,
                c: cpu.c,
                d: cpu.d,
                e: cpu.e,
                h: cpu.h,
                l: cpu.l,
                a_prime: cpu.a_prime,
                f_prime: cpu.f_prime,
                b_prime: cpu.b_prime,
                c_prime: cpu.c_prime,
                d_prime: cpu.d_prime,
                e_prime: cpu.e_prime,
                h_prime: cpu.h_prime,
                l_prime: cpu.l_prime,
                ix: cpu.ix,
                iy: cpu.iy,
                i: cpu.i,
                r: cpu.r,
                sp: cpu.sp,
                pc: cpu.pc,
                iff1: cpu.iff1,
                iff2: cpu.iff2,
                im: cpu.im,
                halted: cpu.halted,
                cycles: cpu.cycles,
            },
            machine: MachineState {
                ram: bus.ram.clone(),
                ext_ram: bus.ext_ram.clone(),
                sram: bus.sram.clone(),
                vdp: bus.vdp.clone(),
                mapper: bus.mapper,
                mapper_attempts: bus.mapper_attempts,
                control: bus.control.to_vec(),
                profile: bus.profile,
                hw: bus.hw.bits(),
                pal: bus.pal,
                io_ctl: bus.io_ctl,
                io_sg: bus.io_sg,
                fm_ctl: bus.fm_ctl,
                io_gg: bus.io_gg.to_vec(),
                vdp_hlatch: bus.vdp_hlatch,
            },
            nmi_state: self.nmi_state,
        };
        serde_json::to_value(&state).unwrap_or(Value::Null)
    }

    fn load_state(&mut self, v: &Value) -> Result<(), serde_json::Error> {
        let state: SmsState = serde_json::from_value(v.clone())?;
        let s = &state.cpu;

        let cpu = &mut self.cpu;
        cpu.a = s.a;
        cpu.f = s.f;
        cpu.b = s.b;
        cpu.c = s.c;
        cpu.d = s.d;
        cpu.e = s.e;
        cpu.h = s.h;
        cpu.l = s.l;
        cpu.a_prime = s.a_prime;
        cpu.f_prime = s.f_prime;
        cpu.b_prime = s.b_prime;
        cpu.c_prime = s.c_prime;
        cpu.d_prime = s.d_prime;
        cpu.e_prime = s.e_prime;
        cpu.h_prime = s.h_prime;
        cpu.l_prime = s.l_prime;
        cpu.ix = s.ix;
        cpu.iy = s.iy;
        cpu.i = s.i;
        cpu.r = s.r;
        cpu.sp = s.sp;
        cpu.pc = s.pc;
        cpu.iff1 = s.iff1;
        cpu.iff2 = s.iff2;
        cpu.im = s.im;
        cpu.halted = s.halted;
        cpu.cycles = s.cycles;

        let m = state.machine;
        let bus = &mut cpu.bus;
        bus.mapper = m.mapper;
        bus.profile = m.profile;
        bus.pal = m.pal;
        bus.hw = HwFlags::from_bits_truncate(m.hw);

        // rebuild the base map, then restore contents and registers over
        // its side effects, then replay the bank registers
        bus.setup_memory();

        if m.ram.len() == bus.ram.len() {
            bus.ram.copy_from_slice(&m.ram);
        }
        if m.ext_ram.len() == bus.ext_ram.len() {
            bus.ext_ram.copy_from_slice(&m.ext_ram);
        }
        bus.sram = m.sram;
        bus.vdp = m.vdp;
        bus.mapper_attempts = m.mapper_attempts;
        if m.control.len() == bus.control.len() {
            bus.control.copy_from_slice(&m.control);
        }
        bus.io_ctl = m.io_ctl;
        bus.io_sg = m.io_sg;
        bus.fm_ctl = m.fm_ctl;
        if m.io_gg.len() == bus.io_gg.len() {
            bus.io_gg.copy_from_slice(&m.io_gg);
        }
        bus.vdp_hlatch = m.vdp_hlatch;
        bus.state_loaded();

        self.nmi_state = state.nmi_state;
        Ok(())
    }

    fn supports_save_states(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sega8_core::cpu_z80::BusZ80;

    fn system_with_rom(rom: Vec<u8>) -> SmsSystem {
        let mut sys = SmsSystem::new(Config::default());
        sys.load_rom(rom);
        sys
    }

    fn tmr_rom(size: usize, hw: u8) -> Vec<u8> {
        let mut rom = vec![0u8; size];
        rom[0x8000 - 16..0x8000 - 8].copy_from_slice(b"TMR SEGA");
        rom[0x8000 - 4..0x8000].copy_from_slice(&0x40001234u32.to_le_bytes());
        rom[0x8000 - 1] = hw << 4;
        rom
    }

    #[test]
    fn test_v_counter_wraparound() {
        // NTSC, 192 visible: counts to 0xda, jumps back, ends at 0xff
        assert_eq!(v_counter_for_line(218, 262, 192, false), 0xda);
        assert_eq!(v_counter_for_line(219, 262, 192, false), 0xd5);
        assert_eq!(v_counter_for_line(261, 262, 192, false), 0xff);
        // NTSC, 224 visible
        assert_eq!(v_counter_for_line(234, 262, 224, false), 0xea);
        assert_eq!(v_counter_for_line(235, 262, 224, false), 0xeb - 6);
        // PAL, 192 visible
        assert_eq!(v_counter_for_line(242, 313, 192, true), 0xf2);
        assert_eq!(v_counter_for_line(243, 313, 192, true), 243 - 57);
        assert_eq!(v_counter_for_line(312, 313, 192, true), 0xff);
        // PAL, 240 visible
        assert_eq!(v_counter_for_line(266, 313, 240, true), (266u16 - 256) as u8);
        assert_eq!(v_counter_for_line(267, 313, 240, true), (267u16 - 57) as u8);
    }

    #[test]
    fn test_visible_lines_modes() {
        let mut regs = [0u8; 16];
        assert_eq!(visible_lines(&regs), 192);
        regs[0] = 0x06;
        regs[1] = 0x10;
        assert_eq!(visible_lines(&regs), 224);
        regs[1] = 0x08;
        assert_eq!(visible_lines(&regs), 240);
        regs[0] = 0x02; // mode bits incomplete: stays 192
        assert_eq!(visible_lines(&regs), 192);
    }

    #[test]
    fn test_power_on_with_header_selects_sega_mapper() {
        // valid export header at 0x8000, hardware type 3 (SMS Japan)
        let mut sys = system_with_rom(tmr_rom(256 * 1024, 3));
        let bus = sys.bus();
        assert_eq!(bus.mapper, Some(MapperKind::Sega));
        assert!(bus.hw.contains(HwFlags::JAPAN));
        assert!(bus.hw.contains(HwFlags::FM));
        // linear power-on banking: 0x8000 window holds bank 2
        assert_eq!(sys.bus().control[0x0f], 2);
        // Japanese non-GG console: RAM filled with 0xf0
        assert_eq!(sys.cpu.bus.read(0xc000), 0xf0);
    }

    #[test]
    fn test_gg_cartridge_detected_from_header() {
        let sys = system_with_rom(tmr_rom(256 * 1024, 6));
        assert_eq!(sys.bus().profile, Profile::GameGear);
        // overseas region for hardware type 6
        assert!(!sys.bus().hw.contains(HwFlags::JAPAN));
    }

    #[test]
    fn test_frame_asserts_vblank_interrupt() {
        // BIOS defaults enable the VBlank interrupt (reg 1 bit 5)
        let mut sys = system_with_rom(vec![0u8; 0x8000]);
        sys.step_frame().unwrap();
        assert!(sys.bus().vdp.pending_ints & 1 != 0);
        assert!(sys.bus().vdp.irq);
        // reading the status port acknowledges
        let cpu_view = sys.cpu.view();
        sys.cpu.bus.io_read(0xbf, cpu_view);
        assert!(!sys.bus().vdp.irq);
    }

    #[test]
    fn test_frame_resets_cycle_counter() {
        let mut sys = system_with_rom(vec![0u8; 0x8000]);
        sys.step_frame().unwrap();
        assert_eq!(sys.cpu.cycles, 0);
        sys.step_frame().unwrap();
        assert_eq!(sys.cpu.cycles, 0);
    }

    #[test]
    fn test_step_frame_without_rom_fails() {
        let mut sys = SmsSystem::new(Config::default());
        assert!(matches!(sys.step_frame(), Err(SmsError::NoRom)));
    }

    #[test]
    fn test_pause_button_nmi_is_edge_triggered() {
        let mut sys = system_with_rom(vec![0u8; 0x10000]);
        // each NMI pushes the return address: watch the stack pointer
        sys.cpu.bus.pad[0] = 0x80;
        sys.step_frame().unwrap();
        assert_eq!(sys.cpu.sp, 0xfffe);
        // held button must not retrigger
        sys.step_frame().unwrap();
        assert_eq!(sys.cpu.sp, 0xfffe);
        // release and press again
        sys.cpu.bus.pad[0] = 0x00;
        sys.step_frame().unwrap();
        sys.cpu.bus.pad[0] = 0x80;
        sys.step_frame().unwrap();
        assert_eq!(sys.cpu.sp, 0xfffc);
    }

    #[test]
    fn test_save_and_load_state_roundtrip() {
        let mut sys = system_with_rom(tmr_rom(256 * 1024, 4));
        sys.cpu.bus.write_mem(0xc100, 0x77);
        sys.cpu.bus.xwrite(0xffff, 5, 0x0200);
        sys.cpu.pc = 0x1234;
        let state = sys.save_state();

        let mut other = system_with_rom(tmr_rom(256 * 1024, 4));
        other.load_state(&state).unwrap();
        assert_eq!(other.cpu.pc, 0x1234);
        assert_eq!(other.cpu.bus.read(0xc100), 0x77);
        assert_eq!(other.bus().mapper, Some(MapperKind::Sega));
        // bank 5 mapping replayed from the control registers
        assert_eq!(other.bus().control[0x0f], 5);
        assert_eq!(
            other.cpu.bus.read(0x8000),
            sys.cpu.bus.read(0x8000)
        );
    }

    #[test]
    fn test_region_override_beats_header() {
        let mut cfg = Config::default();
        cfg.region = Region::Overseas;
        let mut sys = SmsSystem::new(cfg);
        sys.load_rom(tmr_rom(256 * 1024, 3)); // header says Japan
        assert!(!sys.bus().hw.contains(HwFlags::JAPAN));
    }

    #[test]
    fn test_fm_disabled_by_config() {
        let mut cfg = Config::default();
        cfg.enable_fm = false;
        let mut sys = SmsSystem::new(cfg);
        sys.load_rom(vec![0u8; 0x8000]);
        assert!(!sys.bus().hw.contains(HwFlags::FM));
    }
}
