// SPDX-FileCopyrightText: Copyright (c) 2024-2026 modbus-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RS-485 driver-enable control.
//!
//! On Linux the kernel can toggle the transceiver's driver-enable line
//! itself; this is configured through the `TIOCGRS485`/`TIOCSRS485`
//! ioctls. Other platforms silently skip the configuration.

#[cfg(target_os = "linux")]
pub(crate) use linux::{disable_driver, enable_driver, DriverState};

#[cfg(not(target_os = "linux"))]
pub(crate) use fallback::{disable_driver, enable_driver, DriverState};

#[cfg(target_os = "linux")]
mod linux {
    use std::{io, mem, os::unix::io::AsRawFd};

    use tokio_serial::SerialStream;

    const TIOCGRS485: libc::c_ulong = 0x542E;
    const TIOCSRS485: libc::c_ulong = 0x542F;

    const SER_RS485_ENABLED: u32 = 1;

    /// Mirror of the kernel's `struct serial_rs485`.
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub(crate) struct SerialRs485 {
        flags: u32,
        delay_rts_before_send: u32,
        delay_rts_after_send: u32,
        padding: [u32; 5],
    }

    /// The port configuration to restore on disconnect.
    #[derive(Debug, Clone, Copy)]
    pub(crate) struct DriverState(SerialRs485);

    #[allow(unsafe_code)]
    fn get_rs485(fd: libc::c_int) -> io::Result<SerialRs485> {
        let mut config: SerialRs485 = unsafe { mem::zeroed() };
        let res = unsafe { libc::ioctl(fd, TIOCGRS485 as _, &mut config) };
        if res != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(config)
    }

    #[allow(unsafe_code)]
    fn set_rs485(fd: libc::c_int, config: &SerialRs485) -> io::Result<()> {
        let res = unsafe { libc::ioctl(fd, TIOCSRS485 as _, config) };
        if res != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Turn on kernel-driven RS-485 mode and return the previous state.
    pub(crate) fn enable_driver(serial: &SerialStream) -> io::Result<DriverState> {
        let fd = serial.as_raw_fd();
        let previous = get_rs485(fd)?;
        let mut config = previous;
        config.flags |= SER_RS485_ENABLED;
        set_rs485(fd, &config)?;
        Ok(DriverState(previous))
    }

    /// Restore the configuration captured by [`enable_driver`].
    pub(crate) fn disable_driver(serial: &SerialStream, state: DriverState) -> io::Result<()> {
        set_rs485(serial.as_raw_fd(), &state.0)
    }
}

#[cfg(not(target_os = "linux"))]
mod fallback {
    use std::io;

    use tokio_serial::SerialStream;

    #[derive(Debug, Clone, Copy)]
    pub(crate) struct DriverState;

    pub(crate) fn enable_driver(_serial: &SerialStream) -> io::Result<DriverState> {
        log::debug!("RS-485 driver control is not supported on this platform");
        Ok(DriverState)
    }

    pub(crate) fn disable_driver(_serial: &SerialStream, _state: DriverState) -> io::Result<()> {
        Ok(())
    }
}
