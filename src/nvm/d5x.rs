//! # D5x/E5x NVM driver
//!
//! Register map, commands, and erase/write sequencing for the SAM D5x/E5x
//! family NVM controller: 16-bit accesses for
//! `CTRLA`/`CTRLB`/`INTFLAG`/`STATUS` (two byte transfers, low then high),
//! 32-bit `ADDR`, block-of-16-pages erase granularity, and a quad-word
//! write path for the user page.

use super::{
    apply_mask_bool, decode_lock_bits, encode_lock_bits, load_buffer_at, validate_erase, validate_lock_regions,
    validate_offset, validate_page, DeviceGeometry, NvmDriver, OptionState, PageBufferState,
};
use crate::applet::Applet;
use crate::error::{Error, Result};
use crate::samba::SambaClient;
use crate::transport::timeout;
use std::time::Instant;

const REG_BASE: u32 = 0x4100_4000;
const CTRLA: u32 = 0x00;
const CTRLB: u32 = 0x04;
const INTFLAG: u32 = 0x10;
const STATUS: u32 = 0x12;
const ADDR: u32 = 0x14;
const RUNLOCK: u32 = 0x18;

const CMD_EP: u32 = 0x00;
const CMD_EB: u32 = 0x01;
const CMD_WP: u32 = 0x03;
const CMD_WQW: u32 = 0x04;
#[allow(dead_code)]
const CMD_LR: u32 = 0x11;
#[allow(dead_code)]
const CMD_UR: u32 = 0x12;
const CMD_SSB: u32 = 0x16;
const CMD_PBC: u32 = 0x15;

const INTFLAG_ERROR_MASK: u16 = 0xCE;
const STATUS_READY_MASK: u16 = 0x0001;

/// Blocks are 16 pages on this family.
const PAGES_PER_GRANULE: u32 = 16;

/// Width of one write-quad-word chunk, in bytes.
const QUAD_WORD_SIZE: u32 = 16;

const USER_PAGE_BASE: u32 = 0x0080_4000;
const BOD_DISABLE_MASK: u8 = 0x01;
const BOR_MASK: u8 = 0x02;
const LOCK_BYTE_OFFSET: usize = 8;

/// Drives the D5x/E5x NVM controller over an already-identified
/// `SambaClient` session.
pub struct D5xDriver {
    geometry: DeviceGeometry,
    applet: Applet,
    page_buffer: PageBufferState,
    bod: OptionState<bool>,
    bor: OptionState<bool>,
    security: OptionState<bool>,
    lock_regions: OptionState<Vec<bool>>,
    auto_erase: bool,
}

impl D5xDriver {
    pub fn new(geometry: DeviceGeometry) -> Self {
        let applet = Applet::new(geometry.applet_base);
        Self {
            geometry,
            applet,
            page_buffer: PageBufferState::default(),
            bod: OptionState::new(false),
            bor: OptionState::new(false),
            security: OptionState::new(false),
            lock_regions: OptionState::new(Vec::new()),
            auto_erase: true,
        }
    }

    fn granule_size(&self) -> u32 {
        self.geometry.page_size * PAGES_PER_GRANULE
    }

    fn read_reg16(&self, client: &mut SambaClient, offset: u32) -> Result<u16> {
        let low = client.read_byte(REG_BASE + offset)?;
        let high = client.read_byte(REG_BASE + offset + 1)?;
        Ok(low as u16 | ((high as u16) << 8))
    }

    fn write_reg16(&self, client: &mut SambaClient, offset: u32, value: u16) -> Result<()> {
        client.write_byte(REG_BASE + offset, (value & 0xFF) as u8)?;
        client.write_byte(REG_BASE + offset + 1, ((value >> 8) & 0xFF) as u8)
    }

    /// Blocks until `STATUS` reports ready, bounded by `timeout::LONG`.
    fn wait_ready(&self, client: &mut SambaClient) -> Result<()> {
        let start = Instant::now();
        loop {
            let status = self.read_reg16(client, STATUS)?;
            if status & STATUS_READY_MASK != 0 {
                return Ok(());
            }
            if start.elapsed() >= timeout::LONG {
                return Err(Error::TransportTimeout);
            }
        }
    }

    /// Wait-command-wait-check sequence. Dispatches through `CTRLB`,
    /// unlike the D2x family's `CTRLA`.
    fn command(&self, client: &mut SambaClient, cmd: u32) -> Result<()> {
        self.wait_ready(client)?;
        self.write_reg16(client, CTRLB, 0xA500 | cmd as u16)?;
        self.wait_ready(client)?;
        let flags = self.read_reg16(client, INTFLAG)?;
        if flags & INTFLAG_ERROR_MASK != 0 {
            self.write_reg16(client, INTFLAG, INTFLAG_ERROR_MASK)?;
            return Err(Error::FlashCmdError {
                command: cmd as u16,
                flags,
            });
        }
        Ok(())
    }

    fn set_addr(&self, client: &mut SambaClient, byte_addr: u32) -> Result<()> {
        client.write_word(REG_BASE + ADDR, byte_addr)
    }

    /// Sets the cache-disable bits and clears the auto-write bits in
    /// `CTRLA` before a manual write sequence.
    fn enter_manual_write(&self, client: &mut SambaClient) -> Result<()> {
        let ctrla = self.read_reg16(client, CTRLA)?;
        let tweaked = (ctrla | (0x3 << 14)) & 0xFFCF;
        self.write_reg16(client, CTRLA, tweaked)
    }

    fn erase_block(&self, client: &mut SambaClient, byte_addr: u32) -> Result<()> {
        self.set_addr(client, byte_addr)?;
        self.command(client, CMD_EB)
    }

    fn erase_page(&self, client: &mut SambaClient, byte_addr: u32) -> Result<()> {
        self.set_addr(client, byte_addr)?;
        self.command(client, CMD_EP)
    }

    /// Runs the double-buffered pipeline write against `dst`, then issues
    /// `write_cmd` (`WP` for a regular page, `WQW` for a user-page
    /// quad-word chunk).
    fn run_pipeline(&mut self, client: &mut SambaClient, dst: u32, words: u32, write_cmd: u32) -> Result<()> {
        self.enter_manual_write(client)?;
        self.command(client, CMD_PBC)?;

        let src = self.page_buffer.active_address(&self.geometry);
        self.applet.set_src_addr(client, src)?;
        self.applet.set_dst_addr(client, dst)?;
        self.applet.set_words(client, words)?;
        self.applet.set_stack(client, self.geometry.applet_stack)?;

        self.page_buffer.toggle();
        self.wait_ready(client)?;
        self.applet.runv(client, self.applet.code_entry())?;

        self.set_addr(client, dst)?;
        self.command(client, write_cmd)
    }

    fn active_buffer_address(&self) -> u32 {
        self.page_buffer.active_address(&self.geometry)
    }
}

impl NvmDriver for D5xDriver {
    fn geometry(&self) -> &DeviceGeometry {
        &self.geometry
    }

    fn erase_all(&mut self, client: &mut SambaClient, offset: u32) -> Result<()> {
        if client.capabilities().can_chip_erase {
            return client.chip_erase(self.geometry.flash_base + offset);
        }
        let granule = self.granule_size();
        let total = self.geometry.total_size();
        validate_erase(offset, total - offset, granule, total)?;
        let mut addr = offset;
        while addr < total {
            self.erase_block(client, self.geometry.flash_base + addr)?;
            addr += granule;
        }
        Ok(())
    }

    fn write_page(&mut self, client: &mut SambaClient, page: u32) -> Result<()> {
        validate_page(page, self.geometry.page_count)?;
        if self.auto_erase && page % PAGES_PER_GRANULE == 0 {
            self.erase_block(client, self.geometry.page_address(page))?;
        }
        let dst = self.geometry.page_address(page);
        self.run_pipeline(client, dst, self.geometry.page_size / 4, CMD_WP)
    }

    fn read_page(&mut self, client: &mut SambaClient, page: u32, buf: &mut [u8]) -> Result<()> {
        validate_page(page, self.geometry.page_count)?;
        let addr = self.geometry.page_address(page);
        let data = client.read(addr, buf.len())?;
        buf.copy_from_slice(&data);
        Ok(())
    }

    fn write_buffer(&mut self, client: &mut SambaClient, dst_relative: u32, size: u32) -> Result<()> {
        validate_offset(dst_relative, self.geometry.page_size, self.geometry.total_size())?;
        let granule = self.granule_size();
        if self.auto_erase && dst_relative % granule == 0 {
            validate_erase(dst_relative, size, granule, self.geometry.total_size())?;
            self.erase_block(client, self.geometry.flash_base + dst_relative)?;
        }
        let src = self.active_buffer_address();
        client.write_buffer(src, self.geometry.flash_base + dst_relative, size)
    }

    fn load_buffer(&mut self, client: &mut SambaClient, data: &[u8], offset: usize, size: usize) -> Result<()> {
        load_buffer_at(client, self.active_buffer_address(), data, offset, size)
    }

    fn set_lock_regions(&mut self, regions: Vec<bool>) -> Result<()> {
        validate_lock_regions(&regions, self.geometry.lock_region_count)?;
        self.lock_regions.set(regions);
        Ok(())
    }

    fn get_lock_regions(&mut self, client: &mut SambaClient) -> Result<Vec<bool>> {
        let word = client.read_word(REG_BASE + RUNLOCK)?;
        Ok(decode_lock_bits(&word.to_le_bytes(), self.geometry.lock_region_count))
    }

    fn set_bod(&mut self, enable: bool) {
        // The user-page bit is a *disable* flag: "enable BOD" clears it.
        self.bod.set(!enable);
    }

    fn set_bor(&mut self, enable: bool) {
        self.bor.set(enable);
    }

    fn set_security(&mut self) {
        self.security.set(true);
    }

    fn write_options(&mut self, client: &mut SambaClient) -> Result<()> {
        let user_page_dirty = self.bod.dirty || self.bor.dirty || self.lock_regions.dirty;

        if user_page_dirty {
            let page_size = self.geometry.page_size as usize;
            let mut page = client.read(USER_PAGE_BASE, page_size)?;

            if self.bod.dirty {
                page[0] = apply_mask_bool(page[0], BOD_DISABLE_MASK, self.bod.value);
            }
            if self.bor.dirty {
                page[1] = apply_mask_bool(page[1], BOR_MASK, self.bor.value);
            }
            if self.lock_regions.dirty {
                encode_lock_bits(&mut page[LOCK_BYTE_OFFSET..], &self.lock_regions.value);
            }

            self.erase_page(client, USER_PAGE_BASE)?;

            let mut offset = 0u32;
            while offset < self.geometry.page_size {
                let chunk = page[offset as usize..(offset + QUAD_WORD_SIZE) as usize].to_vec();
                load_buffer_at(client, self.active_buffer_address(), &chunk, 0, chunk.len())?;
                self.run_pipeline(client, USER_PAGE_BASE + offset, QUAD_WORD_SIZE / 4, CMD_WQW)?;
                offset += QUAD_WORD_SIZE;
            }

            self.bod.clear_dirty();
            self.bor.clear_dirty();
            self.lock_regions.clear_dirty();
        }

        if self.security.dirty {
            self.command(client, CMD_SSB)?;
            self.security.clear_dirty();
        }

        Ok(())
    }

    fn auto_erase(&self) -> bool {
        self.auto_erase
    }

    fn set_auto_erase(&mut self, enable: bool) {
        self.auto_erase = enable;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockPort;

    fn geometry() -> DeviceGeometry {
        DeviceGeometry::new(0x0000_0000, 4096, 512, 1, 32, 0x2000_4000, 0x2000_c000).unwrap()
    }

    fn client_on(port: &MockPort) -> SambaClient {
        port.push_target_reply(b"\r\n");
        port.push_target_reply(b"v2.0 [Arduino:XYZP]\n\r\x00");
        SambaClient::connect(Box::new(port.clone())).unwrap()
    }

    /// Connects with a banner that omits the `X` (chip-erase) capability
    /// marker, so `erase_all` is forced down the per-granule erase loop
    /// instead of delegating to the single-shot chip-erase command.
    fn client_on_without_chip_erase(port: &MockPort) -> SambaClient {
        port.push_target_reply(b"\r\n");
        port.push_target_reply(b"v2.0 [Arduino:YZP]\n\r\x00");
        SambaClient::connect(Box::new(port.clone())).unwrap()
    }

    fn push_byte(port: &MockPort, value: u8) {
        port.push_target_reply(&[value]);
    }

    #[test]
    fn erase_all_without_chip_erase_capability_sends_sixteen_block_erases() {
        let port = MockPort::new();
        let mut client = client_on_without_chip_erase(&port);
        // 256 pages * 1024 bytes == 256 KiB total; 16-page (0x4000) blocks == 16 erases.
        let geometry = DeviceGeometry::new(0x0000_0000, 256, 1024, 1, 32, 0x2000_4000, 0x2000_c000).unwrap();
        for _ in 0..16 {
            push_byte(&port, 0x01); // STATUS ready (low byte)
            push_byte(&port, 0x00); // STATUS high byte
            push_byte(&port, 0x01);
            push_byte(&port, 0x00);
            push_byte(&port, 0x00); // INTFLAG low, no error
            push_byte(&port, 0x00); // INTFLAG high
        }
        let mut driver = D5xDriver::new(geometry);
        driver.erase_all(&mut client, 0).unwrap();
        let sent = port.sent();
        let sent = String::from_utf8_lossy(&sent);
        let block_size = 16 * 1024;
        for block in 0..16 {
            let addr = format!("W{:08x},{:08x}#", REG_BASE + ADDR, block * block_size);
            assert!(sent.contains(&addr), "missing erase for block {block}: {addr}");
        }
    }

    #[test]
    fn address_is_written_byte_exact_not_halved() {
        let port = MockPort::new();
        let mut client = client_on(&port);
        let driver = D5xDriver::new(geometry());
        driver.set_addr(&mut client, 0x0000_1000).unwrap();
        assert!(port.sent().ends_with(b"W41004014,00001000#"));
    }

    #[test]
    fn ctrla_manual_write_tweak_sets_and_clears_expected_bits() {
        let port = MockPort::new();
        let mut client = client_on(&port);
        push_byte(&port, 0x00); // CTRLA low
        push_byte(&port, 0x00); // CTRLA high
        let driver = D5xDriver::new(geometry());
        driver.enter_manual_write(&mut client).unwrap();
        // (0 | (0x3 << 14)) & 0xFFCF == 0xC000
        assert!(port.sent().ends_with(b"O41004001,c0#"));
    }

    #[test]
    fn command_error_mask_checks_wider_intflag_bits() {
        let port = MockPort::new();
        let mut client = client_on(&port);
        push_byte(&port, 0x01); // STATUS ready before
        push_byte(&port, 0x00);
        push_byte(&port, 0x01); // STATUS ready after
        push_byte(&port, 0x00);
        push_byte(&port, 0xce); // INTFLAG low: all error bits
        push_byte(&port, 0x00);
        let driver = D5xDriver::new(geometry());
        let err = driver.command(&mut client, CMD_PBC).unwrap_err();
        assert!(matches!(err, Error::FlashCmdError { .. }));
    }

    #[test]
    fn lock_region_vector_rejected_when_longer_than_supported() {
        let mut driver = D5xDriver::new(geometry());
        assert!(driver.set_lock_regions(vec![true; 33]).is_err());
        assert!(driver.set_lock_regions(vec![true; 32]).is_ok());
    }

    #[test]
    fn write_options_is_noop_when_nothing_dirty() {
        let port = MockPort::new();
        let mut client = client_on(&port);
        let mut driver = D5xDriver::new(geometry());
        let before = port.sent().len();
        driver.write_options(&mut client).unwrap();
        assert_eq!(port.sent().len(), before);
    }
}
