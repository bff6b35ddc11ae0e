use std::time::Duration;

use rusb::{Device, DeviceHandle, UsbContext};

use crate::cmd::DevboardError;
use crate::{DEVBOARD_PID, DEVBOARD_VID};

type Result<T> = ::std::result::Result<T, DevboardError>;

/// Timeout of every interrupt transfer.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_millis(250);

const INTERFACE: u8 = 0;
const CONFIGURATION: u8 = 1;
const EP_OUT: u8 = 0x02;
const EP_IN: u8 = 0x81;

/// Ordered, timeout-bounded packet exchange with one board.
///
/// Each call moves exactly one interrupt packet. Implementations must not
/// retry internally; a timeout is reported as [`DevboardError::UsbTimeout`].
pub trait Transport {
    fn send(&mut self, packet: &[u8]) -> Result<()>;
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        (**self).send(packet)
    }
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).receive(buf)
    }
}

/// Policy for waiting out a device that reports busy while its
/// configuration is selected, typically because another process holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyRetry {
    pub interval: Duration,
    /// `None` waits until the device frees up or the process is killed.
    pub max_attempts: Option<u32>,
}
impl Default for BusyRetry {
    fn default() -> Self {
        BusyRetry {
            interval: Duration::from_millis(100),
            max_attempts: None,
        }
    }
}
impl BusyRetry {
    /// Runs `op` until it stops reporting [`rusb::Error::Busy`].
    pub fn run(&self, mut op: impl FnMut() -> rusb::Result<()>) -> Result<()> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match op() {
                Ok(()) => return Ok(()),
                Err(rusb::Error::Busy) => {
                    if attempts == 1 {
                        log::info!("usb device is busy, blocking until it's free");
                    }
                    if self.max_attempts.map_or(false, |max| attempts >= max) {
                        return Err(DevboardError::UsbBusyRetriesExhausted { attempts });
                    }
                    std::thread::sleep(self.interval);
                }
                Err(e) => return Err(DevboardError::UsbSetConfigurationFailure(e)),
            }
        }
    }
}

/// Picks the device to open from an enumerated `(vendor, product)` list.
///
/// `index` counts every device of the vendor regardless of product id, so
/// boards in bootloader mode and in normal mode share one index space. The
/// selected device is only accepted if its product id matches too.
pub fn select_device(ids: &[(u16, u16)], vid: u16, pid: u16, index: usize) -> Option<usize> {
    ids.iter()
        .enumerate()
        .filter(|&(_, &(v, _))| v == vid)
        .nth(index)
        .filter(|&(_, &(_, p))| p == pid)
        .map(|(pos, _)| pos)
}

/// A claimed development board on the USB bus.
///
/// Owns the libusb context; dropping the transport releases the interface
/// and hands the device back to its kernel driver.
#[derive(Debug)]
pub struct UsbTransport<T: UsbContext> {
    _context: T,
    device: Device<T>,
    handle: DeviceHandle<T>,
    has_kernel_driver: bool,
}

impl<T: UsbContext> Drop for UsbTransport<T> {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(INTERFACE) {
            log::warn!("could not release interface: {}", e);
        }

        if self.has_kernel_driver {
            if let Err(e) = self.handle.attach_kernel_driver(INTERFACE) {
                log::warn!("could not reattach kernel driver: {}", e);
            }
        }
    }
}
impl<T: UsbContext> UsbTransport<T> {
    /// Opens the `index`-th board with the standard Silego ids.
    pub fn open_board(ctx: T, index: usize, retry: &BusyRetry) -> Result<Self> {
        Self::open(ctx, DEVBOARD_VID, DEVBOARD_PID, index, retry)
    }

    /// Opens and claims the device chosen by [`select_device`].
    pub fn open(ctx: T, vid: u16, pid: u16, index: usize, retry: &BusyRetry) -> Result<Self> {
        let devices = ctx
            .devices()
            .map_err(|e| DevboardError::UsbDeviceListFailure(e))?;

        let mut candidates = vec![];
        let mut ids = vec![];
        for device in devices.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            if desc.vendor_id() == vid {
                log::debug!(
                    "found silego device at bus {}, port {}",
                    device.bus_number(),
                    device.port_number()
                );
            }
            ids.push((desc.vendor_id(), desc.product_id()));
            candidates.push(device);
        }

        let pos = select_device(&ids, vid, pid, index).ok_or(DevboardError::UsbDeviceNotFound)?;
        let device = candidates.swap_remove(pos);
        log::info!(
            "using device at bus {}, port {}",
            device.bus_number(),
            device.port_number()
        );

        let handle = device
            .open()
            .map_err(|e| DevboardError::UsbOpenFailure(e))?;

        let has_kernel_driver = match handle.detach_kernel_driver(INTERFACE) {
            Ok(()) => true,
            Err(rusb::Error::NotFound) | Err(rusb::Error::NotSupported) => false,
            Err(e) => return Err(DevboardError::UsbDetachKernelDriverFailure(e)),
        };

        let claimed = retry
            .run(|| handle.set_active_configuration(CONFIGURATION))
            .and_then(|()| {
                handle
                    .claim_interface(INTERFACE)
                    .map_err(|e| DevboardError::UsbClaimInterfaceFailure(e))
            });
        if let Err(e) = claimed {
            if has_kernel_driver {
                let _ = handle.attach_kernel_driver(INTERFACE);
            }
            return Err(e);
        }

        Ok(UsbTransport {
            _context: ctx,
            device,
            handle,
            has_kernel_driver,
        })
    }

    /// Serial number string of the board.
    pub fn serial_number(&self) -> Result<String> {
        let desc = self
            .device
            .device_descriptor()
            .map_err(|e| DevboardError::UsbStringDescriptorFailure(e))?;
        self.handle
            .read_serial_number_string_ascii(&desc)
            .map_err(|e| DevboardError::UsbStringDescriptorFailure(e))
    }

    /// Finds the board index whose serial number equals `serial`.
    ///
    /// The returned index follows the same counting as [`select_device`].
    pub fn find_board_by_serial(ctx: &T, vid: u16, serial: &str) -> Result<usize> {
        let devices = ctx
            .devices()
            .map_err(|e| DevboardError::UsbDeviceListFailure(e))?;

        let boards = devices.iter().filter(|d| {
            d.device_descriptor()
                .map(|desc| desc.vendor_id() == vid)
                .unwrap_or(false)
        });
        for (index, device) in boards.enumerate() {
            let found = device.device_descriptor().and_then(|desc| {
                let handle = device.open()?;
                handle.read_serial_number_string_ascii(&desc)
            });
            match found {
                Ok(s) if s == serial => return Ok(index),
                Ok(_) => {}
                Err(e) => log::debug!("skipping board {}: {}", index, e),
            }
        }

        Err(DevboardError::UsbDeviceNotFound)
    }
}

impl<T: UsbContext> Transport for UsbTransport<T> {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        let len = self
            .handle
            .write_interrupt(EP_OUT, packet, TRANSFER_TIMEOUT)
            .map_err(|e| match e {
                rusb::Error::Timeout => DevboardError::UsbTimeout,
                e => DevboardError::UsbWriteFailure(e),
            })?;

        if len != packet.len() {
            return Err(DevboardError::UsbWriteMismatch);
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.handle
            .read_interrupt(EP_IN, buf, TRANSFER_TIMEOUT)
            .map_err(|e| match e {
                rusb::Error::Timeout => DevboardError::UsbTimeout,
                e => DevboardError::UsbReadFailure(e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOOT_PID: u16 = crate::DEVBOARD_BOOTLOADER_PID;

    #[test]
    fn no_vendor_match_is_not_found() {
        let ids = [(0x1d6b, 0x0002), (0x046d, 0xc52b)];
        assert_eq!(select_device(&ids, DEVBOARD_VID, DEVBOARD_PID, 0), None);
        assert_eq!(select_device(&[], DEVBOARD_VID, DEVBOARD_PID, 0), None);
    }

    #[test]
    fn index_counts_every_product() {
        let ids = [
            (0x1d6b, 0x0002),
            (DEVBOARD_VID, BOOT_PID),
            (0x046d, 0xc52b),
            (DEVBOARD_VID, DEVBOARD_PID),
        ];
        assert_eq!(select_device(&ids, DEVBOARD_VID, DEVBOARD_PID, 1), Some(3));
        // board 0 is in bootloader mode
        assert_eq!(select_device(&ids, DEVBOARD_VID, DEVBOARD_PID, 0), None);
        assert_eq!(select_device(&ids, DEVBOARD_VID, BOOT_PID, 0), Some(1));
        assert_eq!(select_device(&ids, DEVBOARD_VID, DEVBOARD_PID, 2), None);
    }

    #[test]
    fn busy_retry_is_bounded() {
        let retry = BusyRetry {
            interval: Duration::from_millis(1),
            max_attempts: Some(3),
        };
        let mut calls = 0;
        let res = retry.run(|| {
            calls += 1;
            Err(rusb::Error::Busy)
        });
        assert!(matches!(
            res,
            Err(DevboardError::UsbBusyRetriesExhausted { attempts: 3 })
        ));
        assert_eq!(calls, 3);
    }

    #[test]
    fn busy_retry_waits_out_busy() {
        let retry = BusyRetry {
            interval: Duration::from_millis(1),
            max_attempts: None,
        };
        let mut calls = 0;
        retry
            .run(|| {
                calls += 1;
                if calls < 4 {
                    Err(rusb::Error::Busy)
                } else {
                    Ok(())
                }
            })
            .unwrap();
        assert_eq!(calls, 4);
    }

    #[test]
    fn busy_retry_stops_on_other_errors() {
        let retry = BusyRetry::default();
        let res = retry.run(|| Err(rusb::Error::Access));
        assert!(matches!(
            res,
            Err(DevboardError::UsbSetConfigurationFailure(rusb::Error::Access))
        ));
    }
}
