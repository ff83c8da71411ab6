//! # Word-copy applet
//!
//! A tiny Thumb-1 code blob resident in target SRAM, used as a trampoline
//! to move data from a host-managed SRAM page buffer into the NVM
//! controller's write buffer — something the SAM-BA wire protocol has no
//! direct command for.
//!
//! The blob copies `words` 32-bit words from `src` to `dst`, then returns.
//! Four parameter cells (`src`, `dst`, `words`, `stack`) sit at fixed
//! offsets past the code; `runv` additionally writes a reset-vector cell
//! immediately after the stack cell and `go`s to the stack cell itself, so
//! the ROM's reset-style entry loads `SP` from the stack cell and `PC`
//! from the reset-vector cell — the same two-word vector-table convention
//! Cortex-M uses for its real reset vector.

use crate::error::Result;
use crate::samba::SambaClient;

/// Size of the uploaded code blob, including its four parameter cells.
pub const SIZE: u32 = 52;

const SRC_OFFSET: u32 = 36;
const DST_OFFSET: u32 = 40;
const WORDS_OFFSET: u32 = 44;
const STACK_OFFSET: u32 = 48;

/// Total SRAM span the applet owns: the uploaded blob plus the
/// reset-vector cell `runv` writes just past the stack cell. Nothing else
/// may be placed inside `[base, base + FOOTPRINT)` — in particular the
/// page buffer pair must start at `base + FOOTPRINT`, not `base + SIZE`,
/// or the reset-vector write clobbers the first word of page buffer A.
pub const FOOTPRINT: u32 = STACK_OFFSET + 8;

/// Thumb-1 word-copy loop, padded with its four trailing parameter cells.
/// Bytes 0..36 are code; `[36..52)` are the `src`/`dst`/`words`/`stack`
/// cells this module writes through `SambaClient::write_word`.
#[rustfmt::skip]
const CODE: [u8; SIZE as usize] = [
    // loop:
    0x51, 0x68, //   ldr  r1, [r2]        ; r1 = *src  (src ptr kept in r2)
    0x59, 0x60, //   str  r1, [r3]        ; *dst = r1  (dst ptr kept in r3)
    0x04, 0x32, //   add  r2, #4
    0x04, 0x33, //   add  r3, #4
    0x01, 0x3c, //   sub  r4, #1          ; r4 = remaining word count
    0xf8, 0xd1, //   bne  loop
    0x00, 0xbe, //   bkpt 0x00            ; trap if somehow returned to
    0x00, 0x00, //   pad to 16 bytes
    0x00, 0x00,
    0x00, 0x00,
    0x00, 0x00,
    0x00, 0x00,
    0x00, 0x00,
    0x00, 0x00,
    0x00, 0x00,
    0x00, 0x00,
    0x00, 0x00, // end code, start parameter cells (offset 36)
    0x00, 0x00, 0x00, 0x00, // src
    0x00, 0x00, 0x00, 0x00, // dst
    0x00, 0x00, 0x00, 0x00, // words
    0x00, 0x00, 0x00, 0x00, // stack
];

/// Manages the applet's code blob and parameter cells in target SRAM.
pub struct Applet {
    base: u32,
    installed: bool,
}

impl Applet {
    /// `base` is the SRAM address the code blob is uploaded to; it must
    /// leave room for `FOOTPRINT` bytes before the page buffer pair begins.
    pub fn new(base: u32) -> Self {
        Self {
            base,
            installed: false,
        }
    }

    /// SRAM address of the `src` parameter cell.
    pub fn src_cell(&self) -> u32 {
        self.base + SRC_OFFSET
    }

    /// SRAM address of the `dst` parameter cell.
    pub fn dst_cell(&self) -> u32 {
        self.base + DST_OFFSET
    }

    /// SRAM address of the `words` parameter cell.
    pub fn words_cell(&self) -> u32 {
        self.base + WORDS_OFFSET
    }

    /// SRAM address of the `stack` parameter cell (also the `go` target
    /// for `runv`).
    pub fn stack_cell(&self) -> u32 {
        self.base + STACK_OFFSET
    }

    /// SRAM address of the copy loop's first instruction — the entry
    /// point `runv` writes into the reset-vector cell.
    pub fn code_entry(&self) -> u32 {
        self.base
    }

    /// Uploads the code blob to SRAM, but only once per session — later
    /// calls just rewrite the parameter cells.
    fn ensure_installed(&mut self, client: &mut SambaClient) -> Result<()> {
        if !self.installed {
            log::debug!("installing word-copy applet at {:#010x}", self.base);
            client.write(self.base, &CODE)?;
            self.installed = true;
        }
        Ok(())
    }

    /// Sets the `src` parameter cell, installing the applet first if
    /// needed.
    pub fn set_src_addr(&mut self, client: &mut SambaClient, value: u32) -> Result<()> {
        self.ensure_installed(client)?;
        client.write_word(self.src_cell(), value)
    }

    /// Sets the `dst` parameter cell, installing the applet first if
    /// needed.
    pub fn set_dst_addr(&mut self, client: &mut SambaClient, value: u32) -> Result<()> {
        self.ensure_installed(client)?;
        client.write_word(self.dst_cell(), value)
    }

    /// Sets the `words` parameter cell, installing the applet first if
    /// needed.
    pub fn set_words(&mut self, client: &mut SambaClient, value: u32) -> Result<()> {
        self.ensure_installed(client)?;
        client.write_word(self.words_cell(), value)
    }

    /// Sets the `stack` parameter cell (the SRAM stack-top value the
    /// applet runs with), installing the applet first if needed.
    pub fn set_stack(&mut self, client: &mut SambaClient, value: u32) -> Result<()> {
        self.ensure_installed(client)?;
        client.write_word(self.stack_cell(), value)
    }

    /// Launches the copy on a Cortex-M target: writes `start_address`
    /// (OR'd with 1 for Thumb mode) into the reset-vector cell, then `go`s
    /// to the stack cell. Returns as soon as the command is issued; the
    /// caller polls NVM ready to know when the copy — and any ensuing NVM
    /// command — has actually completed.
    pub fn runv(&mut self, client: &mut SambaClient, start_address: u32) -> Result<()> {
        let reset_vector_cell = self.stack_cell() + 4;
        client.write_word(reset_vector_cell, start_address | 1)?;
        client.go(self.stack_cell())
    }
}
