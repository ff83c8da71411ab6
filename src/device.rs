//! # Device identifier
//!
//! Probes CPUID/CHIPID/DSU registers in the strict order required to avoid
//! hanging the ROM bootloader on an unmapped read, and dispatches to the
//! matching NVM driver with hard-coded geometry.
//!
//! The full chip-ID-to-geometry table lives elsewhere (it's maintained by
//! the CLI this crate is embedded in); this module defines the dispatch
//! *mechanism* and seeds it with a couple of concrete part geometries as
//! worked examples.

use crate::error::{Error, Result};
use crate::nvm::d2x::D2xDriver;
use crate::nvm::d5x::D5xDriver;
use crate::nvm::{DeviceGeometry, NvmDriver};
use crate::samba::SambaClient;

const CPUID_ADDR: u32 = 0xE000_ED00;
const DSU_DID_ADDR: u32 = 0x4100_2018;
const CHIPID_CIDR_ADDR: u32 = 0x400E_0740;
const CHIPID_EXID_ADDR: u32 = 0x400E_0744;
const CHIPID_CIDR_ALT_ADDR: u32 = 0x400E_0940;
const CHIPID_EXID_ALT_ADDR: u32 = 0x400E_0944;
const ARM7_9_CHIPID_ADDR: u32 = 0xFFFF_F240;

const CORTEX_M0PLUS: u32 = 0xC600;
const CORTEX_M4: u32 = 0xC240;

/// Which family a probed chip belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    D2x,
    D5x,
}

/// One dispatch table entry: the masked IDs this geometry was built for,
/// and the geometry/family it maps to.
struct DispatchEntry {
    chip_id_masked: u32,
    ext_chip_id: u32,
    device_id: u32,
    family: Family,
    geometry: DeviceGeometry,
}

/// Builds the seed dispatch table with a couple of concrete part
/// geometries.
fn dispatch_table() -> Vec<DispatchEntry> {
    vec![
        // SAMD21J18A: CPUID 0x410CC600 -> DSU probe -> chipId 0x10010000.
        DispatchEntry {
            chip_id_masked: 0x1001_0000 & 0x7FFF_FFE0,
            ext_chip_id: 0,
            device_id: 0,
            family: Family::D2x,
            geometry: DeviceGeometry::new(0x0000_0000, 4096, 64, 1, 16, 0x2000_4000, 0x2000_8000)
                .expect("fixed, valid power-of-two layout"),
        },
        // A 256 KiB D5x part, 16-page (0x4000) erase blocks.
        DispatchEntry {
            chip_id_masked: 0x6061_0000 & 0x7FFF_FFE0,
            ext_chip_id: 0,
            device_id: 0,
            family: Family::D5x,
            geometry: DeviceGeometry::new(0x0000_0000, 256, 1024, 1, 32, 0x2000_4000, 0x2000_c000)
                .expect("fixed, valid power-of-two layout"),
        },
    ]
}

/// An identified target, holding the live session and the dispatched NVM
/// driver for its family.
pub struct Device {
    client: SambaClient,
    driver: Box<dyn NvmDriver>,
}

impl Device {
    /// Runs the identification protocol over an already-connected client
    /// and constructs the matching NVM driver.
    pub fn create(mut client: SambaClient) -> Result<Self> {
        let (chip_id, ext_chip_id, device_id) = identify(&mut client)?;
        let driver = dispatch(chip_id, ext_chip_id, device_id)?;
        Ok(Self { client, driver })
    }

    pub fn client(&mut self) -> &mut SambaClient {
        &mut self.client
    }

    pub fn driver(&mut self) -> &mut dyn NvmDriver {
        self.driver.as_mut()
    }

    /// Splits into independent mutable borrows of the client and driver,
    /// needed by callers (the `Flash` facade) that must pass both into the
    /// same `NvmDriver` method call.
    pub fn split_mut(&mut self) -> (&mut SambaClient, &mut dyn NvmDriver) {
        (&mut self.client, self.driver.as_mut())
    }

    /// Resets the target by writing to the reset-request address used by
    /// the ROM bootloader's reset-on-disconnect convention. The target
    /// typically resets before acknowledging, so any error here is logged
    /// and discarded rather than propagated.
    pub fn reset(&mut self) {
        let geometry = self.driver.geometry();
        if let Err(err) = self.client.write_word(geometry.applet_stack, 0) {
            log::debug!("ignoring reset write failure (expected if target reset first): {err}");
        }
    }
}

/// Runs the CPUID/CHIPID/DSU probe sequence in the strict order needed to
/// avoid hanging the target on an unmapped read.
fn identify(client: &mut SambaClient) -> Result<(u32, u32, u32)> {
    let word0 = client.read_word(0x0000_0000)?;
    if (word0 >> 24) & 0xFF == 0xEA {
        let chip_id = client.read_word(ARM7_9_CHIPID_ADDR)?;
        return Ok((chip_id, 0, 0));
    }

    let cpuid = client.read_word(CPUID_ADDR)? & 0x0000_FFF0;
    if cpuid == CORTEX_M0PLUS {
        let did = client.read_word(DSU_DID_ADDR)?;
        return Ok((did, 0, 0));
    }
    if cpuid == CORTEX_M4 {
        let word4 = client.read_word(0x0000_0004)?;
        if (word4 >> 20) & 0xFFF == 0x800 {
            return chipid_probe(client);
        }
        let did = client.read_word(DSU_DID_ADDR)?;
        return Ok((did, 0, 0));
    }
    chipid_probe(client)
}

fn chipid_probe(client: &mut SambaClient) -> Result<(u32, u32, u32)> {
    let cidr = client.read_word(CHIPID_CIDR_ADDR)?;
    if cidr != 0 {
        let exid = client.read_word(CHIPID_EXID_ADDR)?;
        return Ok((cidr, exid, 0));
    }
    let cidr = client.read_word(CHIPID_CIDR_ALT_ADDR)?;
    let exid = client.read_word(CHIPID_EXID_ALT_ADDR)?;
    Ok((cidr, exid, 0))
}

/// Selects a dispatch entry by `chipId & 0x7FFFFFE0`, falling back to
/// `deviceId & 0xFFFF00FF` when `chipId == 0`.
fn dispatch(chip_id: u32, ext_chip_id: u32, device_id: u32) -> Result<Box<dyn NvmDriver>> {
    let table = dispatch_table();
    let chip_id_masked = chip_id & 0x7FFF_FFE0;

    let entry = if chip_id == 0 {
        let device_id_masked = device_id & 0xFFFF_00FF;
        table.iter().find(|e| e.device_id == device_id_masked)
    } else {
        table.iter().find(|e| e.chip_id_masked == chip_id_masked)
    };

    let entry = entry.ok_or(Error::DeviceUnsupportedError {
        chip_id,
        ext_chip_id,
        device_id,
    })?;

    Ok(match entry.family {
        Family::D2x => Box::new(D2xDriver::new(entry.geometry)),
        Family::D5x => Box::new(D5xDriver::new(entry.geometry)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockPort;

    fn client_on(port: &MockPort) -> SambaClient {
        port.push_target_reply(b"\r\n");
        port.push_target_reply(b"v2.0 [Arduino:XYZP]\n\r\x00");
        SambaClient::connect(Box::new(port.clone())).unwrap()
    }

    fn push_word(port: &MockPort, value: u32) {
        port.push_target_reply(&value.to_le_bytes());
    }

    #[test]
    fn cortex_m0plus_dsu_probe_dispatches_to_d2x_with_dispatch_table_geometry() {
        let port = MockPort::new();
        let mut client = client_on(&port);
        push_word(&port, 0x0000_0000); // word @ 0x0, not ARM7/9
        push_word(&port, 0x410C_C600); // CPUID masked -> Cortex-M0+
        push_word(&port, 0x1001_0000); // DSU DID

        let device = Device::create(client).unwrap();
        let geometry = *device_geometry(&device);
        assert_eq!(geometry.page_count, 4096);
        assert_eq!(geometry.page_size, 64);
        assert_eq!(geometry.applet_base, 0x2000_4000);
        assert_eq!(geometry.applet_stack, 0x2000_8000);
    }

    fn device_geometry(device: &Device) -> &DeviceGeometry {
        device.driver.geometry()
    }

    #[test]
    fn unknown_chip_id_raises_unsupported_device_error() {
        let port = MockPort::new();
        let mut client = client_on(&port);
        push_word(&port, 0x0000_0000);
        push_word(&port, 0xDEAD_BEE0); // unrecognized CPUID, falls through to CHIPID probe
        push_word(&port, 0xFFFF_FFFF); // CHIPID CIDR: nonzero but matches no dispatch entry
        push_word(&port, 0x0000_0000); // CHIPID EXID
        let err = identify(&mut client).and_then(|(c, e, d)| dispatch(c, e, d));
        assert!(matches!(err, Err(Error::DeviceUnsupportedError { .. })));
    }
}
