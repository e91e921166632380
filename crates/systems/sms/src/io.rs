//! Peripheral-side I/O components: SC-3000 keyboard matrix, printer data
//! decoder, light phaser, and the seams for the external sound chips.
//!
//! The SC-3000 routes its keyboard and cassette through a 8255 PIA mapped
//! to ports 0xdc-0xdf. It is not fully emulated; ports A and B are assumed
//! configured for input and port C for output.

use crate::fixed::div_q32;

/// SC-3000 keyboard keys.
///
/// The matrix has 12 rows of up to 7 columns; rows 0-7 read through PIA
/// port A, rows 8-11 through the low nibble of port B.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    K1, K2, K3, K4, K5, K6, K7, K8, K9, K0,
    Minus, Caret, Yen, Break,
    Q, W, E, R, T, Y, U, I, O, P,
    At, LeftBracket,
    A, S, D, F, G, H, J, K, L,
    Semicolon, Colon, RightBracket, Return, Up,
    Z, X, C, V, B, N, M,
    Comma, Period, Slash, Pi, Down, Left, Right,
    Kana, Space, ClearHome, DelIns,
    Graph, Ctrl, Func, Shift,
}

impl Key {
    /// Matrix position as row | column
    fn code(self) -> u8 {
        use Key::*;
        match self {
            K1 => 0x00, K2 => 0x01, K3 => 0x02, K4 => 0x03,
            K5 => 0x04, K6 => 0x05, K7 => 0x06,
            K8 => 0x80, K9 => 0x81, K0 => 0x82, Minus => 0x83,
            Caret => 0x84, Yen => 0x85, Break => 0x86,

            Q => 0x10, W => 0x11, E => 0x12, R => 0x13,
            T => 0x14, Y => 0x15, U => 0x16,
            I => 0x70, O => 0x71, P => 0x72, At => 0x73, LeftBracket => 0x74,

            A => 0x20, S => 0x21, D => 0x22, F => 0x23,
            G => 0x24, H => 0x25, J => 0x26,
            K => 0x60, L => 0x61, Semicolon => 0x62, Colon => 0x63,
            RightBracket => 0x64, Return => 0x65, Up => 0x66,

            Z => 0x30, X => 0x31, C => 0x32, V => 0x33,
            B => 0x34, N => 0x35, M => 0x36,
            Comma => 0x50, Period => 0x51, Slash => 0x52, Pi => 0x53,
            Down => 0x54, Left => 0x55, Right => 0x56,

            Kana => 0x40, Space => 0x41, ClearHome => 0x42, DelIns => 0x43,

            Graph => 0x96, Ctrl => 0xa6, Func => 0xb5, Shift => 0xb6,
        }
    }
}

/// Keyboard state: one key plus one modifier at a time, which is all the
/// matrix scan in BASIC can make use of anyway
#[derive(Debug, Clone, Copy, Default)]
pub struct Keyboard {
    pub key: Option<Key>,
    pub modifier: Option<Key>,
}

impl Keyboard {
    pub fn set(&mut self, key: Option<Key>, modifier: Option<Key>) {
        self.key = key;
        self.modifier = modifier;
    }

    fn matrix(&self) -> [u8; 12] {
        let mut m = [0u8; 12];
        for k in [self.modifier, self.key].into_iter().flatten() {
            let rc = k.code();
            m[(rc >> 4) as usize] = 1 << (rc & 0x7);
        }
        m
    }

    /// Scan a row range for the selected column; pressed keys read 0
    pub fn scan(&self, column: u8, rows: std::ops::Range<usize>) -> u8 {
        let matrix = self.matrix();
        let mut d = 0u8;
        for row in rows.rev() {
            d = (d << 1) | (matrix[row] & (1 << (column & 7)) == 0) as u8;
        }
        d
    }
}

/// Serial printer data decoder.
///
/// Printer data is sent at about 4.7 KBaud, 10 bits per character: start=0,
/// 8 data bits (LSB first), stop=1. The data line is inverted. No Baud
/// tracking is needed as all bits pass through the PIA BSR port.
#[derive(Debug, Default)]
pub struct Printer {
    bits: u8,
    chr: u8,
    output: Vec<u8>,
}

impl Printer {
    /// Data line write (the inverted line level after the BSR decode)
    pub fn data(&mut self, level: bool) {
        if self.bits == 0 {
            if level {
                // start bit
                self.bits = 8;
            }
        } else {
            self.chr = (self.chr >> 1) | if level { 0 } else { 0x80 };
            self.bits -= 1;
            if self.bits == 0 {
                self.output.push(self.chr);
            }
        }
    }

    /// Reset line write; active low
    pub fn reset(&mut self, level: bool) {
        if !level {
            self.bits = 0;
        }
    }

    /// Take the characters printed so far
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }
}

/// Light phaser position, in 320x224 screen coordinates
#[derive(Debug, Clone, Copy, Default)]
pub struct LightGun {
    pub x: i32,
    pub y: i32,
}

impl LightGun {
    /// Check the sensor against the beam position. `beam_x2` is twice the
    /// H counter value, `scanline` the current line. On a hit, returns the
    /// H counter value software expects to latch for this gun position.
    // TODO mx/my scaling is wrong if V28/V30 mode is used?
    pub fn sense(&self, beam_x2: i32, scanline: i32) -> Option<u8> {
        // off-screen coordinates clamp to the border
        let mx = div_q32((self.x.max(0) * 256) as u32, 320) as i32;
        let my = div_q32((self.y.max(0) * 192) as u32, 224) as i32;
        let dx = beam_x2 - mx;
        let dy = scanline - my;
        if dy > -4 && dy < 4 && dx > -40 && dx < 40 {
            Some(((mx >> 1) + 24) as u8)
        } else {
            None
        }
    }
}

/// PSG (SN76489) seam. The chip itself lives with the sound backend.
pub trait Psg {
    /// Catch up the chip to the given cycle before a register write
    fn flush_to(&mut self, cycles: i32) {
        let _ = cycles;
    }

    /// Register write (ports 0x40-0x7f)
    fn write(&mut self, d: u8);

    /// Game Gear stereo panning write (port 0x06)
    fn stereo_write(&mut self, d: u8) {
        let _ = d;
    }
}

/// FM sound unit (YM2413) seam
pub trait FmUnit {
    fn reg_write(&mut self, d: u8);
    fn data_write(&mut self, d: u8);
}

/// Discards all sound writes
#[derive(Debug, Default)]
pub struct NullSound;

impl Psg for NullSound {
    fn write(&mut self, _d: u8) {}
}

impl FmUnit for NullSound {
    fn reg_write(&mut self, _d: u8) {}
    fn data_write(&mut self, _d: u8) {}
}
