//! Cartridge header probe.
//!
//! Sega's export ROMs carry a "TMR SEGA" block ending at 0x2000, 0x4000 or
//! 0x8000, holding a product code, checksum and hardware type nibble. The
//! probe drives hardware detection at reset: Game Gear cartridges, the
//! region default, and lookups in small databases of titles needing special
//! treatment (50Hz-only releases, FM-incompatible titles, GG carts that run
//! in Master System mode, 3-D glasses games).
//!
//! Codemasters releases, some betas and most unlicensed games have no valid
//! header. Titles without a usable product code are matched by checksum
//! instead, flagged in the tables by the 0x.fff.... pattern.

/// Product codes and hardware type for known 50Hz-only games
static REGION_PAL: [u32; 20] = [
    0x40207067, /* Addams Family */
    0x40207020, /* Back.Future 3 */
    0x40207058, /* Battlemaniacs */
    0x40007105, /* Cal.Games 2 */
    0x402f7065, /* Dracula */
    0x40007109, /* Home Alone */
    0x40009024, /* Pwr.Strike 2 */
    0x40207047, /* Predator 2 EU */
    0x40002519, /* Quest.Yak */
    0x40207064, /* Robocop 3 */
    0x4f205014, /* Sens.Soccer */
    0x40002573, /* Sonic Blast */
    0x40007080, /* S.Harrier EU */
    0x40007038, /* Taito Chase */
    0x40009015, /* Sonic 2 EU */
    /* NBA Jam: no valid id/cksum */
    0x4fff8872, /* Excell.Dizzy */
    0x4ffffac4, /* Fantast.Dizzy */
    0x4fff4a89, /* Csm.Spacehead */
    0x4fffe352, /* Micr.Machines */
    0x4fffa203, /* Bad Apple */
];

/// Product codes and hardware type for known non-FM games
static NO_FMSOUND: [u32; 3] = [
    0x40002070, /* Walter Payton */
    0x40017020, /* American Pro */
    0x4fffe890, /* Wanted */
];

/// Product codes and hardware type for known GG carts running in SMS mode.
/// GG carts having the system type set to 4 (eg. HTH games) run as SMS
/// anyway.
static GG_SMSMODE: [u32; 11] = [
    0x60002401, /* Castl.Ilusion */
    0x6f101018, /* Taito Chase */
    0x70709018, /* Olympic Gold */
    0x70709038, /* Outrun EU */
    0x60801068, /* Predator 2 */
    0x70408098, /* Prince.Persia */
    0x50101037, /* Rastan Saga */
    0x7f086018, /* RC Grandprix */
    0x60002415, /* Super Kickoff */
    0x60801108, /* WWF.Steelcage */
    /* Excell.Dizzy, Fantast.Dizzy, Super Tetris: no valid id/cksum */
    0x4f813028, /* Tesserae */
];

/// Product codes and hardware type for known games using 3-D glasses
static THREE_DEE: [u32; 6] = [
    0x4f008001, /* Missile Def. */
    0x40008007, /* Out Run 3-D */
    0x40008006, /* Poseidon Wars */
    0x40008004, /* Space Harrier */
    0x40008002, /* Zaxxon 3-D */
    0x4fff8793, /* Maze Hunter */
];

/// Decoded "TMR SEGA" header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CartHeader {
    /// Hardware type nibble
    pub hw: u8,
    /// Product code and version
    pub id: u32,
    /// Checksum folded into the id format, for database entries of games
    /// without a usable product code
    pub ck: u32,
}

fn read_le32(rom: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([rom[at], rom[at + 1], rom[at + 2], rom[at + 3]])
}

/// Scan for a "TMR SEGA" block ending at 0x2000, 0x4000 or 0x8000
pub fn probe(rom: &[u8]) -> Option<CartHeader> {
    let mut tmr = 0x2000usize;
    while tmr < 0xbfff && tmr <= rom.len() {
        if &rom[tmr - 16..tmr - 8] == b"TMR SEGA" {
            let hw = rom[tmr - 1] >> 4;
            let id = read_le32(rom, tmr - 4);
            let ck = (read_le32(rom, tmr - 8) >> 16) | (id & 0xf000_0000) | 0x0fff_0000;
            return Some(CartHeader { hw, id, ck });
        }
        tmr *= 2;
    }
    None
}

impl CartHeader {
    /// The id field holds a usable product code
    pub fn valid_id(&self) -> bool {
        self.hw != 0 && (self.id.wrapping_add(1) & 0xfffe) != 0
    }

    /// Hardware type declares a Game Gear cartridge
    pub fn gg_cartridge(&self) -> bool {
        (0x5..0x8).contains(&self.hw)
    }

    /// Hardware type declares a Japanese release
    pub fn japan(&self) -> bool {
        self.hw == 0x5 || self.hw == 0x3
    }

    fn in_table(&self, table: &[u32]) -> bool {
        table.iter().any(|&e| e == self.id || e == self.ck)
    }

    /// Known 50Hz-only release
    pub fn pal_only(&self) -> bool {
        self.in_table(&REGION_PAL)
    }

    /// Known incompatible with the FM sound unit
    pub fn no_fm(&self) -> bool {
        self.in_table(&NO_FMSOUND)
    }

    /// Known GG cartridge that must run in Master System mode
    pub fn gg_sms_mode(&self) -> bool {
        self.in_table(&GG_SMSMODE)
    }

    /// Known to use the 3-D glasses
    pub fn uses_3d_glasses(&self) -> bool {
        self.in_table(&THREE_DEE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_rom(size: usize, tmr: usize, hw: u8, id: u32, cksum: u16) -> Vec<u8> {
        let mut rom = vec![0u8; size];
        rom[tmr - 16..tmr - 8].copy_from_slice(b"TMR SEGA");
        rom[tmr - 8..tmr - 6].copy_from_slice(&[0, 0]); // reserved
        rom[tmr - 6..tmr - 4].copy_from_slice(&cksum.to_le_bytes());
        rom[tmr - 4..tmr].copy_from_slice(&id.to_le_bytes());
        rom[tmr - 1] = (hw << 4) | (rom[tmr - 1] & 0x0f);
        rom
    }

    #[test]
    fn test_probe_at_each_offset() {
        for tmr in [0x2000usize, 0x4000, 0x8000] {
            let rom = make_rom(0x10000, tmr, 4, 0x40001234, 0xbeef);
            let h = probe(&rom).unwrap();
            assert_eq!(h.hw, 4);
            assert_eq!(h.id & 0x0fff_ffff, 0x00001234);
        }
    }

    #[test]
    fn test_probe_no_header() {
        assert!(probe(&vec![0u8; 0x10000]).is_none());
        assert!(probe(&[0u8; 0x1000]).is_none()); // too small to hold one
    }

    #[test]
    fn test_probe_header_at_rom_end() {
        // a 8KB ROM with the block at its very end
        let rom = make_rom(0x2000, 0x2000, 3, 0x30005678, 0);
        let h = probe(&rom).unwrap();
        assert!(h.japan());
        assert!(!h.gg_cartridge());
    }

    #[test]
    fn test_checksum_code_folding() {
        let rom = make_rom(0x8000, 0x4000, 4, 0x4fff0000, 0xfac4);
        let h = probe(&rom).unwrap();
        assert_eq!(h.ck, 0x4ffffac4);
        assert!(!h.valid_id()); // id low bits are a non-code pattern
    }

    #[test]
    fn test_gg_cartridge_range() {
        for (hw, gg) in [(4u8, false), (5, true), (6, true), (7, true), (8, false)] {
            let rom = make_rom(0x8000, 0x8000, hw, 0x40001234, 0);
            assert_eq!(probe(&rom).unwrap().gg_cartridge(), gg, "hw {hw}");
        }
    }

    #[test]
    fn test_database_lookups() {
        // Fantastic Dizzy is matched by checksum, not product code
        let rom = make_rom(0x8000, 0x8000, 4, 0x4fff0000, 0xfac4);
        let h = probe(&rom).unwrap();
        assert!(h.pal_only());
        assert!(!h.no_fm());

        // Castle of Illusion GG cart runs in SMS mode, by product code
        let rom = make_rom(0x8000, 0x8000, 6, 0x60002401, 0);
        let h = probe(&rom).unwrap();
        assert!(h.gg_sms_mode());

        // Space Harrier 3-D
        let rom = make_rom(0x8000, 0x8000, 4, 0x40008004, 0);
        assert!(probe(&rom).unwrap().uses_3d_glasses());
    }
}
