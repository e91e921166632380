//! Zilog Z80 CPU core.
//!
//! The instruction interpreter itself is a minimal stub (enough to exercise
//! interrupt plumbing and bounded execution); what matters to the systems
//! built on top is the *contract*: bounded cycle-driven execution via
//! [`CpuZ80::run_to`], the maskable interrupt line sampled from the bus, the
//! edge-triggered NMI, and bus handlers receiving the live program counter
//! and cycle count of the access through [`CpuView`].

/// Snapshot of CPU position handed to bus handlers.
///
/// Machine-side handlers (VDP latches, tape, mappers) need to know *when*
/// and *from where* an access happened; this carries both without giving
/// the bus a reference back into the CPU.
#[derive(Debug, Clone, Copy)]
pub struct CpuView {
    /// Program counter of the instruction performing the access
    pub pc: u16,
    /// Cycles consumed this frame up to the access
    pub cycles: i32,
}

/// Bus interface for the Z80 CPU
pub trait BusZ80 {
    /// Read a byte from memory
    fn read(&self, addr: u16) -> u8;

    /// Write a byte to memory
    fn write(&mut self, addr: u16, val: u8, cpu: CpuView);

    /// Read from I/O port
    fn io_read(&mut self, port: u16, cpu: CpuView) -> u8 {
        let _ = (port, cpu);
        0xFF
    }

    /// Write to I/O port
    fn io_write(&mut self, port: u16, val: u8, cpu: CpuView) {
        let _ = (port, val, cpu);
    }

    /// Level of the maskable interrupt line as driven by the machine
    fn irq_level(&self) -> bool {
        false
    }
}

/// Zilog Z80 CPU state
#[derive(Debug)]
pub struct CpuZ80<B: BusZ80> {
    /// Main registers
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,

    /// Shadow registers (Z80 specific)
    pub a_prime: u8,
    pub f_prime: u8,
    pub b_prime: u8,
    pub c_prime: u8,
    pub d_prime: u8,
    pub e_prime: u8,
    pub h_prime: u8,
    pub l_prime: u8,

    /// Index registers (Z80 specific)
    pub ix: u16,
    pub iy: u16,

    /// Special registers
    pub i: u8, // Interrupt vector
    pub r: u8, // Memory refresh

    /// Stack pointer
    pub sp: u16,
    /// Program counter
    pub pc: u16,

    /// Interrupt flags
    pub iff1: bool,
    pub iff2: bool,
    pub im: u8, // Interrupt mode (0, 1, or 2)

    /// State
    pub halted: bool,
    /// Cycles consumed this frame
    pub cycles: i32,
    nmi_pending: bool,

    /// Bus interface
    pub bus: B,
}

impl<B: BusZ80> CpuZ80<B> {
    /// Create a new Z80 CPU
    pub fn new(bus: B) -> Self {
        Self {
            a: 0,
            f: 0,
            b: 0,
            c: 0,
            d: 0,
            e: 0,
            h: 0,
            l: 0,
            a_prime: 0,
            f_prime: 0,
            b_prime: 0,
            c_prime: 0,
            d_prime: 0,
            e_prime: 0,
            h_prime: 0,
            l_prime: 0,
            ix: 0,
            iy: 0,
            i: 0,
            r: 0,
            sp: 0,
            pc: 0,
            iff1: false,
            iff2: false,
            im: 1,
            halted: false,
            cycles: 0,
            nmi_pending: false,
            bus,
        }
    }

    /// Reset the CPU
    pub fn reset(&mut self) {
        self.a = 0;
        self.f = 0;
        self.b = 0;
        self.c = 0;
        self.d = 0;
        self.e = 0;
        self.h = 0;
        self.l = 0;
        self.sp = 0;
        self.pc = 0;
        self.iff1 = false;
        self.iff2 = false;
        self.im = 1;
        self.halted = false;
        self.cycles = 0;
        self.nmi_pending = false;
    }

    /// Current position, for bus handlers
    pub fn view(&self) -> CpuView {
        CpuView {
            pc: self.pc,
            cycles: self.cycles,
        }
    }

    /// Request a non-maskable interrupt (taken before the next instruction)
    pub fn nmi(&mut self) {
        self.nmi_pending = true;
    }

    /// Execute instructions until at least `target` cycles have been
    /// consumed this frame. Returns the cycles consumed by this call.
    pub fn run_to(&mut self, target: i32) -> i32 {
        let start = self.cycles;
        while self.cycles < target {
            let c = self.step();
            self.cycles += c as i32;
        }
        self.cycles - start
    }

    /// Rebase the frame cycle counter (called at end of frame)
    pub fn reset_cycles(&mut self) {
        self.cycles = 0;
    }

    /// Execute one instruction
    pub fn step(&mut self) -> u32 {
        if self.nmi_pending {
            self.nmi_pending = false;
            self.halted = false;
            self.iff2 = self.iff1;
            self.iff1 = false;
            self.push_pc();
            self.pc = 0x0066;
            return 11;
        }

        if self.iff1 && self.bus.irq_level() {
            // IM 1: RST 38h. IM 0/2 are not used by the systems built on
            // this core and fall back to the same vector.
            self.halted = false;
            self.iff1 = false;
            self.iff2 = false;
            self.push_pc();
            self.pc = 0x0038;
            return 13;
        }

        if self.halted {
            return 4;
        }

        let opcode = self.read_pc();
        self.execute(opcode)
    }

    fn push_pc(&mut self) {
        let view = self.view();
        self.sp = self.sp.wrapping_sub(1);
        self.bus.write(self.sp, (self.pc >> 8) as u8, view);
        self.sp = self.sp.wrapping_sub(1);
        self.bus.write(self.sp, (self.pc & 0xFF) as u8, view);
    }

    fn read_pc(&mut self) -> u8 {
        let val = self.bus.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        self.r = self.r.wrapping_add(1);
        val
    }

    fn execute(&mut self, opcode: u8) -> u32 {
        match opcode {
            0x00 => 4, // NOP
            0x76 => {
                self.halted = true;
                4
            } // HALT
            0xF3 => {
                self.iff1 = false;
                self.iff2 = false;
                4
            } // DI
            0xFB => {
                self.iff1 = true;
                self.iff2 = true;
                4
            } // EI
            0xD3 => {
                // OUT (n), A
                let port = self.read_pc() as u16 | ((self.a as u16) << 8);
                let view = self.view();
                let a = self.a;
                self.bus.io_write(port, a, view);
                11
            }
            0xDB => {
                // IN A, (n)
                let port = self.read_pc() as u16 | ((self.a as u16) << 8);
                let view = self.view();
                self.a = self.bus.io_read(port, view);
                11
            }
            _ => 4, // Placeholder - stub implementation
        }
    }
}

impl<B: BusZ80> crate::Cpu for CpuZ80<B> {
    fn reset(&mut self) {
        self.reset();
    }

    fn step(&mut self) -> u32 {
        self.step()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RamBus {
        ram: Vec<u8>,
        irq: bool,
    }

    impl RamBus {
        fn new() -> Self {
            Self {
                ram: vec![0; 0x10000],
                irq: false,
            }
        }
    }

    impl BusZ80 for RamBus {
        fn read(&self, addr: u16) -> u8 {
            self.ram[addr as usize]
        }

        fn write(&mut self, addr: u16, val: u8, _cpu: CpuView) {
            self.ram[addr as usize] = val;
        }

        fn irq_level(&self) -> bool {
            self.irq
        }
    }

    #[test]
    fn test_run_to_consumes_cycles() {
        let mut cpu = CpuZ80::new(RamBus::new());
        let consumed = cpu.run_to(100);
        assert!(consumed >= 100);
        assert_eq!(cpu.cycles, consumed);
    }

    #[test]
    fn test_di_ei() {
        let mut cpu = CpuZ80::new(RamBus::new());
        cpu.bus.ram[0] = 0xFB; // EI
        cpu.bus.ram[1] = 0xF3; // DI
        cpu.step();
        assert!(cpu.iff1);
        cpu.cycles += 4;
        cpu.step();
        assert!(!cpu.iff1);
    }

    #[test]
    fn test_irq_taken_when_enabled() {
        let mut cpu = CpuZ80::new(RamBus::new());
        cpu.bus.ram[0] = 0xFB; // EI
        cpu.sp = 0xDFF0;
        cpu.step();
        cpu.bus.irq = true;
        cpu.step();
        assert_eq!(cpu.pc, 0x0038);
        assert!(!cpu.iff1);
        // return address pushed
        assert_eq!(cpu.bus.ram[0xDFEE], 0x01);
    }

    #[test]
    fn test_irq_masked_when_disabled() {
        let mut cpu = CpuZ80::new(RamBus::new());
        cpu.bus.irq = true;
        cpu.step();
        assert_ne!(cpu.pc, 0x0038);
    }

    #[test]
    fn test_nmi_wakes_halt() {
        let mut cpu = CpuZ80::new(RamBus::new());
        cpu.bus.ram[0] = 0x76; // HALT
        cpu.sp = 0xDFF0;
        cpu.step();
        assert!(cpu.halted);
        cpu.nmi();
        cpu.step();
        assert_eq!(cpu.pc, 0x0066);
        assert!(!cpu.halted);
    }
}
