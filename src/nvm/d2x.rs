//! # D2x/L21/R21 NVM driver
//!
//! Register map, commands, and erase/write sequencing for the SAM D2x,
//! L21, and R21 family NVM controller: 32-bit register accesses
//! throughout, half-word address encoding, row-of-4-pages erase
//! granularity.

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
const INTFLAG: u32 = 0x14;
#[allow(dead_code)]
const STATUS: u32 = 0x18;
const ADDR: u32 = 0x1C;
const LOCK: u32 = 0x20;

const CMD_ER: u32 = 0x02;
const CMD_WP: u32 = 0x04;
#[allow(dead_code)]
const CMD_EAR: u32 = 0x05;
#[allow(dead_code)]
const CMD_WAP: u32 = 0x06;
#[allow(dead_code)]
const CMD_LR: u32 = 0x40;
#[allow(dead_code)]
const CMD_UR: u32 = 0x41;
const CMD_SSB: u32 = 0x45;
const CMD_PBC: u32 = 0x44;

const INTFLAG_ERROR_MASK: u32 = 0x02;
const INTFLAG_READY_MASK: u32 = 0x01;

/// Rows are 4 pages on this family.
const PAGES_PER_GRANULE: u32 = 4;

const USER_ROW_BASE: u32 = 0x0080_4000;
const BOD_MASK: u8 = 0x06;
const BOR_MASK: u8 = 0x07;
const LOCK_BYTE_OFFSET: usize = 6;

/// Drives the D2x/L21/R21 NVM controller over an already-identified
/// `SambaClient` session.
pub struct D2xDriver {
    geometry: DeviceGeometry,
    applet: Applet,
    page_buffer: PageBufferState,
    bod: OptionState<bool>,
    bor: OptionState<bool>,
    security: OptionState<bool>,
    lock_regions: OptionState<Vec<bool>>,
    auto_erase: bool,
}

impl D2xDriver {
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

    /// Blocks until `INTFLAG` reports ready, bounded by `timeout::LONG` so
    /// a wedged target surfaces as a timeout rather than hanging forever.
    fn wait_ready(&self, client: &mut SambaClient) -> Result<()> {
        let start = Instant::now();
        loop {
            let flags = client.read_word(REG_BASE + INTFLAG)?;
            if flags & INTFLAG_READY_MASK != 0 {
                return Ok(());
            }
            if start.elapsed() >= timeout::LONG {
                return Err(Error::TransportTimeout);
            }
        }
    }

    /// Wait-command-wait-check sequence: block until ready, dispatch the
    /// command with the `0xA500` key byte, wait for ready again, then
    /// check and clear the error flag.
    fn command(&self, client: &mut SambaClient, cmd: u32) -> Result<()> {
        self.wait_ready(client)?;
        client.write_word(REG_BASE + CTRLA, 0xA500 | cmd)?;
        self.wait_ready(client)?;
        let flags = client.read_word(REG_BASE + INTFLAG)?;
        if flags & INTFLAG_ERROR_MASK != 0 {
            client.write_word(REG_BASE + INTFLAG, INTFLAG_ERROR_MASK)?;
            return Err(Error::FlashCmdError {
                command: cmd as u16,
                flags: flags as u16,
            });
        }
        Ok(())
    }

    fn set_addr(&self, client: &mut SambaClient, byte_addr: u32) -> Result<()> {
        client.write_word(REG_BASE + ADDR, byte_addr / 2)
    }

    fn erase_granule(&self, client: &mut SambaClient, byte_addr: u32) -> Result<()> {
        self.set_addr(client, byte_addr)?;
        self.command(client, CMD_ER)
    }

    /// Runs the double-buffered pipeline write against `dst`, copying
    /// `words` 32-bit words out of the currently active SRAM page buffer.
    fn run_pipeline(&mut self, client: &mut SambaClient, dst: u32, words: u32) -> Result<()> {
        let mut ctrlb = client.read_word(REG_BASE + CTRLB)?;
        ctrlb |= (1 << 18) | (1 << 7);
        client.write_word(REG_BASE + CTRLB, ctrlb)?;

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
        self.command(client, CMD_WP)
    }

    fn active_buffer_address(&self) -> u32 {
        self.page_buffer.active_address(&self.geometry)
    }
}

impl NvmDriver for D2xDriver {
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
            self.erase_granule(client, self.geometry.flash_base + addr)?;
            addr += granule;
        }
        Ok(())
    }

    fn write_page(&mut self, client: &mut SambaClient, page: u32) -> Result<()> {
        validate_page(page, self.geometry.page_count)?;
        if self.auto_erase && page % PAGES_PER_GRANULE == 0 {
            self.erase_granule(client, self.geometry.page_address(page))?;
        }
        let dst = self.geometry.page_address(page);
        self.run_pipeline(client, dst, self.geometry.page_size / 4)
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
            self.erase_granule(client, self.geometry.flash_base + dst_relative)?;
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
        let word = client.read_word(REG_BASE + LOCK)?;
        Ok(decode_lock_bits(&word.to_le_bytes(), self.geometry.lock_region_count))
    }

    fn set_bod(&mut self, enable: bool) {
        self.bod.set(enable);
    }

    fn set_bor(&mut self, enable: bool) {
        self.bor.set(enable);
    }

    fn set_security(&mut self) {
        self.security.set(true);
    }

    fn write_options(&mut self, client: &mut SambaClient) -> Result<()> {
        let user_row_dirty = self.bod.dirty || self.bor.dirty || self.lock_regions.dirty;

        if user_row_dirty {
            let row_size = (self.geometry.page_size * PAGES_PER_GRANULE) as usize;
            let mut row = client.read(USER_ROW_BASE, row_size)?;

            if self.bod.dirty {
                row[1] = apply_mask_bool(row[1], BOD_MASK, self.bod.value);
            }
            if self.bor.dirty {
                row[1] = apply_mask_bool(row[1], BOR_MASK, self.bor.value);
            }
            if self.lock_regions.dirty {
                encode_lock_bits(&mut row[LOCK_BYTE_OFFSET..], &self.lock_regions.value);
            }

            self.erase_granule(client, USER_ROW_BASE)?;
            for page in 0..PAGES_PER_GRANULE {
                let start = (page * self.geometry.page_size) as usize;
                let end = start + self.geometry.page_size as usize;
                let chunk = row[start..end].to_vec();
                load_buffer_at(client, self.active_buffer_address(), &chunk, 0, chunk.len())?;
                let dst = USER_ROW_BASE + start as u32;
                self.run_pipeline(client, dst, self.geometry.page_size / 4)?;
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
        DeviceGeometry::new(0x0000_0000, 4096, 64, 1, 16, 0x2000_4000, 0x2000_8000).unwrap()
    }

    fn client_on(port: &MockPort) -> SambaClient {
        port.push_target_reply(b"\r\n");
        port.push_target_reply(b"v2.0 [Arduino:XYZP]\n\r\x00");
        SambaClient::connect(Box::new(port.clone())).unwrap()
    }

    fn push_word(port: &MockPort, value: u32) {
        port.push_target_reply(&value.to_le_bytes());
    }

    #[test]
    fn device_geometry_accepts_4096_page_64_byte_layout() {
        let g = DeviceGeometry::new(0x0000_0000, 4096, 64, 1, 16, 0x2000_4000, 0x2000_8000).unwrap();
        assert_eq!(g.page_count, 4096);
        assert_eq!(g.page_size, 64);
        assert_eq!(g.applet_base, 0x2000_4000);
        assert_eq!(g.applet_stack, 0x2000_8000);
    }

    #[test]
    fn erase_all_delegates_to_chip_erase_when_advertised() {
        let port = MockPort::new();
        let mut client = client_on(&port);
        port.push_target_reply(b"X00\x00");
        let mut driver = D2xDriver::new(geometry());
        driver.erase_all(&mut client, 0).unwrap();
        assert!(port.sent().ends_with(b"X00000000#"));
    }

    #[test]
    fn erase_granule_writes_halfword_address() {
        let port = MockPort::new();
        let mut client = client_on(&port);
        // ready poll before command, ready poll after, intflag check (no error)
        push_word(&port, 0x01);
        push_word(&port, 0x01);
        push_word(&port, 0x00);
        let driver = D2xDriver::new(geometry());
        driver.erase_granule(&mut client, 0x0000_0100).unwrap();
        let sent = port.sent();
        let sent = String::from_utf8_lossy(&sent);
        assert!(sent.contains("W4100401c,00000080")); // ADDR = 0x100/2
        assert!(sent.contains("W41004000,a5000002")); // CTRLA write with ER cmd
    }

    #[test]
    fn command_raises_flash_cmd_error_and_clears_flag() {
        let port = MockPort::new();
        let mut client = client_on(&port);
        push_word(&port, 0x01); // wait ready before
        push_word(&port, 0x01); // wait ready after
        push_word(&port, 0x02); // error bit set
        let driver = D2xDriver::new(geometry());
        let err = driver.command(&mut client, CMD_PBC).unwrap_err();
        assert!(matches!(err, Error::FlashCmdError { .. }));
        let sent = port.sent();
        let sent = String::from_utf8_lossy(&sent);
        assert!(sent.contains("W41004014,00000002")); // INTFLAG cleared
    }

    #[test]
    fn buffer_toggle_flips_once_per_write_page() {
        let port = MockPort::new();
        let mut client = client_on(&port);
        let mut driver = D2xDriver::new(geometry());
        driver.set_auto_erase(false);

        for _ in 0..3 {
            push_word(&port, 0x5a5a5a00); // read CTRLB
            push_word(&port, 0x01); // PBC wait before
            push_word(&port, 0x01); // PBC wait after
            push_word(&port, 0x00); // PBC intflag ok
            push_word(&port, 0x01); // explicit pre-run wait
            push_word(&port, 0x01); // WP wait before
            push_word(&port, 0x01); // WP wait after
            push_word(&port, 0x00); // WP intflag ok
        }

        let start_is_a = driver.page_buffer.is_a_active();
        driver.write_page(&mut client, 0).unwrap();
        assert_eq!(driver.page_buffer.is_a_active(), !start_is_a);
        driver.write_page(&mut client, 1).unwrap();
        assert_eq!(driver.page_buffer.is_a_active(), start_is_a);
        driver.write_page(&mut client, 2).unwrap();
        assert_eq!(driver.page_buffer.is_a_active(), !start_is_a);
    }

    #[test]
    fn lock_region_vector_rejected_when_longer_than_supported() {
        let mut driver = D2xDriver::new(geometry());
        assert!(driver.set_lock_regions(vec![true; 17]).is_err());
        assert!(driver.set_lock_regions(vec![true; 16]).is_ok());
    }

    #[test]
    fn write_options_is_noop_when_nothing_dirty() {
        let port = MockPort::new();
        let mut client = client_on(&port);
        let mut driver = D2xDriver::new(geometry());
        let before = port.sent().len();
        driver.write_options(&mut client).unwrap();
        assert_eq!(port.sent().len(), before);
    }
}
