//! Host-side SAM-BA programmer for Atmel/Microchip SAM D2x/L21/R21 and
//! D5x/E5x NVM controllers.
//!
//! Drives the on-chip SAM-BA ROM bootloader over an already-opened serial
//! connection to identify the attached part and erase, program, verify,
//! and configure its flash. Serial port lifecycle (opening, closing, baud
//! changes), file-level CLI orchestration, and the full chip-ID-to-geometry
//! table live outside this crate; see [`Device::create`] for the boundary.

pub mod applet;
pub mod buffer;
pub mod device;
pub mod error;
pub mod nvm;
pub mod samba;
pub mod transport;

pub use device::Device;
pub use error::{Error, Result};
pub use nvm::NvmDriver;
pub use samba::SambaClient;
pub use transport::{PortConfig, SerialConnection};

/// Caller-facing flashing API: wraps an identified [`Device`] and reports
/// progress through optional observer callbacks.
pub struct Flash {
    device: Device,
    on_status: Option<Box<dyn FnMut(&str)>>,
    on_progress: Option<Box<dyn FnMut(usize, usize)>>,
}

impl Flash {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            on_status: None,
            on_progress: None,
        }
    }

    pub fn set_on_status(&mut self, callback: impl FnMut(&str) + 'static) {
        self.on_status = Some(Box::new(callback));
    }

    pub fn set_on_progress(&mut self, callback: impl FnMut(usize, usize) + 'static) {
        self.on_progress = Some(Box::new(callback));
    }

    fn status(&mut self, message: &str) {
        log::info!("{message}");
        if let Some(callback) = self.on_status.as_mut() {
            callback(message);
        }
    }

    fn progress(&mut self, done: usize, total: usize) {
        log::debug!("progress: {done}/{total}");
        if let Some(callback) = self.on_progress.as_mut() {
            callback(done, total);
        }
    }

    pub fn erase_all(&mut self, offset: u32) -> Result<()> {
        self.status("erasing flash");
        let (client, driver) = self.device.split_mut();
        driver.erase_all(client, offset)
    }

    pub fn load_buffer(&mut self, data: &[u8], offset: usize, size: usize) -> Result<()> {
        let (client, driver) = self.device.split_mut();
        driver.load_buffer(client, data, offset, size)
    }

    pub fn write_page(&mut self, page: u32) -> Result<()> {
        let (client, driver) = self.device.split_mut();
        driver.write_page(client, page)
    }

    /// Writes an entire image, page by page, reporting progress after
    /// each page.
    pub fn write_image(&mut self, data: &[u8]) -> Result<()> {
        let page_size = self.device.driver().geometry().page_size as usize;
        let total_pages = (data.len() + page_size - 1) / page_size;
        self.status(&format!("writing {total_pages} pages"));
        for page in 0..total_pages {
            let offset = page * page_size;
            let remaining = data.len() - offset;
            let chunk_size = remaining.min(page_size);
            self.load_buffer(data, offset, chunk_size)?;
            self.write_page(page as u32)?;
            self.progress(page + 1, total_pages);
        }
        Ok(())
    }

    pub fn read_page(&mut self, page: u32, buf: &mut [u8]) -> Result<()> {
        let (client, driver) = self.device.split_mut();
        driver.read_page(client, page, buf)
    }

    pub fn write_buffer(&mut self, dst_relative: u32, size: u32) -> Result<()> {
        let (client, driver) = self.device.split_mut();
        driver.write_buffer(client, dst_relative, size)
    }

    pub fn set_lock_regions(&mut self, regions: Vec<bool>) -> Result<()> {
        self.device.driver().set_lock_regions(regions)
    }

    pub fn get_lock_regions(&mut self) -> Result<Vec<bool>> {
        let (client, driver) = self.device.split_mut();
        driver.get_lock_regions(client)
    }

    pub fn set_bod(&mut self, enable: bool) {
        self.device.driver().set_bod(enable);
    }

    pub fn set_bor(&mut self, enable: bool) {
        self.device.driver().set_bor(enable);
    }

    pub fn set_security(&mut self) {
        self.device.driver().set_security();
    }

    pub fn write_options(&mut self) -> Result<()> {
        self.status("flushing flash options");
        let (client, driver) = self.device.split_mut();
        driver.write_options(client)
    }
}
