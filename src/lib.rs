#![no_std]

#[cfg(test)]
extern crate std;

use core::convert::Infallible;

use embedded_graphics_core::pixelcolor::{Rgb565, raw::RawU16};
use embedded_graphics_core::prelude::RawData;
use embedded_hal::digital::OutputPin;
#[cfg(not(feature = "async"))]
use embedded_hal::spi::SpiDevice;
#[cfg(feature = "async")]
use embedded_hal_async::spi::SpiDevice;

// Native resolution of the family-default panel (bare ST7735, 128RGB×160)
pub const SCREEN_WIDTH: u16 = 128; // Physical width (short edge)
pub const SCREEN_HEIGHT: u16 = 160; // Physical height (long edge)

// Command-table framing: bit 7 of the argument-count byte says a delay byte
// follows the arguments; a delay byte of 255 stands for 500 ms.
pub const DELAY_FLAG: u8 = 0x80;
const MAX_TABLE_ARGS: usize = (DELAY_FLAG - 1) as usize; // 7-bit argument count

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Instruction {
    /// No Operation (00h) - Discarded by the controller
    Nop = 0x00,
    /// Software Reset (01h) - Restores command and parameter defaults
    SoftwareReset = 0x01,
    /// Read Display ID (04h) - Returns manufacturer and version information
    ReadDisplayId = 0x04,
    /// Read Display Status (09h) - Checks display operating state
    ReadDisplayStatus = 0x09,

    /// Sleep In (10h) - Enter low-power mode
    SleepIn = 0x10,
    /// Sleep Out (11h) - Exit low-power mode
    SleepOut = 0x11,
    /// Partial Display Mode On (12h) - Enable regional refresh
    PartialModeOn = 0x12,
    /// Normal Display Mode On (13h) - Full-screen mode
    NormalDisplayOn = 0x13,

    /// Display Inversion Off (20h) - Disable color inversion
    DisplayInversionOff = 0x20,
    /// Display Inversion On (21h) - Enable color inversion
    DisplayInversionOn = 0x21,

    /// Display Off (28h) - Disable panel output
    DisplayOff = 0x28,
    /// Display On (29h) - Enable panel output
    DisplayOn = 0x29,
    /// Column Address Set (2Ah) - Horizontal addressing bounds
    ColumnAddressSet = 0x2A,
    /// Row Address Set (2Bh) - Vertical addressing bounds
    RowAddressSet = 0x2B,
    /// Memory Write (2Ch) - Write to memory
    MemoryWrite = 0x2C,
    /// Memory Read (2Eh) - Read back from memory
    MemoryRead = 0x2E,

    /// Partial Area (30h) - Partial-mode row span
    PartialArea = 0x30,
    /// Tearing Effect Line Off (34h) - Disable VSync output
    TearingEffectOff = 0x34,
    /// Tearing Effect Line On (35h) - Enable VSync output
    TearingEffectOn = 0x35,
    /// Memory Access Control (36h) - GRAM orientation/order
    MemoryAccessControl = 0x36,
    /// Pixel Format Set (3Ah) - Color depth configuration
    PixelFormatSet = 0x3A,

    /// Frame Rate Control, normal mode (B1h)
    FrameRateControl1 = 0xB1,
    /// Frame Rate Control, idle mode (B2h)
    FrameRateControl2 = 0xB2,
    /// Frame Rate Control, partial mode (B3h)
    FrameRateControl3 = 0xB3,
    /// Display Inversion Control (B4h) - Dot/line inversion selection
    DisplayInversionControl = 0xB4,

    /// Power Control 1 (C0h) - GVDD and AVDD levels
    PowerControl1 = 0xC0,
    /// Power Control 2 (C1h) - VGH/VGL supply factors
    PowerControl2 = 0xC1,
    /// Power Control 3 (C2h) - Opamp current, normal mode
    PowerControl3 = 0xC2,
    /// Power Control 4 (C3h) - Opamp current, idle mode
    PowerControl4 = 0xC3,
    /// Power Control 5 (C4h) - Opamp current, partial mode
    PowerControl5 = 0xC4,
    /// VCOM Control 1 (C5h) - Common voltage level
    VcomControl1 = 0xC5,

    /// Positive Gamma Correction (E0h)
    PositiveGammaControl = 0xE0,
    /// Negative Gamma Correction (E1h)
    NegativeGammaControl = 0xE1,
}

// Memory Access Control (36h) bit assignments
pub const MADCTL_MY: u8 = 0x80; // Row address order (bottom to top)
pub const MADCTL_MX: u8 = 0x40; // Column address order (right to left)
pub const MADCTL_MV: u8 = 0x20; // Row/column exchange
pub const MADCTL_ML: u8 = 0x10; // Vertical refresh order
pub const MADCTL_RGB: u8 = 0x00; // Subpixel order red-green-blue
pub const MADCTL_BGR: u8 = 0x08; // Subpixel order blue-green-red
pub const MADCTL_MH: u8 = 0x04; // Horizontal refresh order

/// Quadrant orientations selectable through the memory access control
/// register.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Rotation {
    Deg0 = 0,
    Deg90 = 1,
    Deg180 = 2,
    Deg270 = 3,
}

impl Rotation {
    /// Normalize an arbitrary quadrant index; values wrap modulo 4.
    pub fn from_index(index: u8) -> Self {
        match index % 4 {
            0 => Rotation::Deg0,
            1 => Rotation::Deg90,
            2 => Rotation::Deg180,
            _ => Rotation::Deg270,
        }
    }

    /// Get the next rotation in the cycle
    pub fn next(self) -> Self {
        match self {
            Rotation::Deg0 => Rotation::Deg90,
            Rotation::Deg90 => Rotation::Deg180,
            Rotation::Deg180 => Rotation::Deg270,
            Rotation::Deg270 => Rotation::Deg0,
        }
    }

    /// Get rotation angle in degrees for logging
    pub fn degrees(self) -> u16 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

// One record per quadrant: the MADCTL byte to transmit and whether the
// panel start offsets trade places.
struct RotationEntry {
    madctl: u8,
    swap_offsets: bool,
}

const ROTATION_TABLE: [RotationEntry; 4] = [
    RotationEntry {
        madctl: MADCTL_MX | MADCTL_MY | MADCTL_RGB,
        swap_offsets: false,
    },
    RotationEntry {
        madctl: MADCTL_MY | MADCTL_MV | MADCTL_RGB,
        swap_offsets: true,
    },
    RotationEntry {
        madctl: MADCTL_RGB,
        swap_offsets: false,
    },
    RotationEntry {
        madctl: MADCTL_MX | MADCTL_MV | MADCTL_RGB,
        swap_offsets: true,
    },
];

#[derive(Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    pub width: u16,
    pub height: u16,
    /// Column offset of the visible glass within controller RAM
    pub colstart: u16,
    /// Row offset of the visible glass within controller RAM
    pub rowstart: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            width: SCREEN_WIDTH,
            height: SCREEN_HEIGHT,
            colstart: 0,
            rowstart: 0,
        }
    }
}

#[derive(Debug)]
pub enum Error<E = ()> {
    /// Communication error
    Comm(E),
    /// Pin setting error
    Pin(Infallible),
}

/// Byte-at-a-time access to an opaque immutable command table.
///
/// Tables usually live in flash as plain byte slices, but any medium able
/// to hand out bytes in order works. `None` means the source is exhausted.
pub trait ByteSource {
    fn next_byte(&mut self) -> Option<u8>;
}

impl ByteSource for &[u8] {
    fn next_byte(&mut self) -> Option<u8> {
        let (&byte, rest) = self.split_first()?;
        *self = rest;
        Some(byte)
    }
}

/// One decoded command-table record.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TableCommand {
    pub opcode: u8,
    args: [u8; MAX_TABLE_ARGS],
    arg_len: u8,
    delay_ms: Option<u16>,
}

impl TableCommand {
    pub fn args(&self) -> &[u8] {
        &self.args[..self.arg_len as usize]
    }

    /// Post-command settle delay, already mapped from the 255 sentinel to
    /// 500 ms.
    pub fn delay_ms(&self) -> Option<u16> {
        self.delay_ms
    }
}

/// Walks a byte-encoded command table.
///
/// A table starts with a command count; each command is an opcode, an
/// argument-count byte (low 7 bits count, bit 7 = delay byte follows), the
/// argument bytes and the optional delay byte. A truncated table ends the
/// walk early.
pub struct TableReader<S: ByteSource> {
    source: S,
    remaining: u8,
}

impl<S: ByteSource> TableReader<S> {
    pub fn new(mut source: S) -> Self {
        let remaining = source.next_byte().unwrap_or(0);
        Self { source, remaining }
    }

    /// Commands not yet read out.
    pub fn remaining(&self) -> u8 {
        self.remaining
    }
}

impl<S: ByteSource> Iterator for TableReader<S> {
    type Item = TableCommand;

    fn next(&mut self) -> Option<TableCommand> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let opcode = self.source.next_byte()?;
        let count = self.source.next_byte()?;
        let arg_len = count & !DELAY_FLAG;
        let mut args = [0u8; MAX_TABLE_ARGS];
        for slot in args.iter_mut().take(arg_len as usize) {
            *slot = self.source.next_byte()?;
        }
        let delay_ms = if count & DELAY_FLAG != 0 {
            let raw = self.source.next_byte()?;
            Some(if raw == 255 { 500 } else { u16::from(raw) })
        } else {
            None
        };

        Some(TableCommand {
            opcode,
            args,
            arg_len,
            delay_ms,
        })
    }
}

/// Ready-to-run power-up tables for common panel variants, encoded in the
/// command-table format.
pub mod tables {
    use super::{DELAY_FLAG, Instruction};

    /// ST7735R (red tab) bring-up: frame rate, power rails, gamma, 16-bit
    /// color, 128x160 window.
    #[rustfmt::skip]
    pub const ST7735R: &[u8] = &[
        21,                                               // 21 commands follow
        Instruction::SoftwareReset as u8, DELAY_FLAG,     // software reset, settle
        150,
        Instruction::SleepOut as u8, DELAY_FLAG,          // wake up (255 = 500 ms)
        255,
        Instruction::FrameRateControl1 as u8, 3,          // frame rate, normal mode
        0x01, 0x2C, 0x2D,
        Instruction::FrameRateControl2 as u8, 3,          // frame rate, idle mode
        0x01, 0x2C, 0x2D,
        Instruction::FrameRateControl3 as u8, 6,          // frame rate, partial mode
        0x01, 0x2C, 0x2D, 0x01, 0x2C, 0x2D,
        Instruction::DisplayInversionControl as u8, 1,    // no inversion
        0x07,
        Instruction::PowerControl1 as u8, 3,              // -4.6V, AUTO mode
        0xA2, 0x02, 0x84,
        Instruction::PowerControl2 as u8, 1,              // VGH25/VGSEL/VGH
        0xC5,
        Instruction::PowerControl3 as u8, 2,              // opamp current small
        0x0A, 0x00,
        Instruction::PowerControl4 as u8, 2,              // BCLK/2
        0x8A, 0x2A,
        Instruction::PowerControl5 as u8, 2,
        0x8A, 0xEE,
        Instruction::VcomControl1 as u8, 1,
        0x0E,
        Instruction::DisplayInversionOff as u8, 0,
        Instruction::MemoryAccessControl as u8, 1,        // row/col order, BGR
        0xC8,
        Instruction::PixelFormatSet as u8, 1,             // 16-bit color
        0x05,
        Instruction::ColumnAddressSet as u8, 4,           // columns 0..=127
        0x00, 0x00, 0x00, 0x7F,
        Instruction::RowAddressSet as u8, 4,              // rows 0..=159
        0x00, 0x00, 0x00, 0x9F,
        Instruction::PositiveGammaControl as u8, 16,
        0x02, 0x1C, 0x07, 0x12, 0x37, 0x32, 0x29, 0x2D,
        0x29, 0x25, 0x2B, 0x39, 0x00, 0x01, 0x03, 0x10,
        Instruction::NegativeGammaControl as u8, 16,
        0x03, 0x1D, 0x07, 0x06, 0x2E, 0x2C, 0x29, 0x2D,
        0x2E, 0x2E, 0x37, 0x3F, 0x00, 0x00, 0x02, 0x10,
        Instruction::NormalDisplayOn as u8, DELAY_FLAG,
        10,
        Instruction::DisplayOn as u8, DELAY_FLAG,
        100,
    ];

    /// Generic ST7789 bring-up: 16-bit color, 240x320 window, inverted
    /// panel glass.
    #[rustfmt::skip]
    pub const ST7789: &[u8] = &[
        9,                                                // 9 commands follow
        Instruction::SoftwareReset as u8, DELAY_FLAG,     // software reset, settle
        150,
        Instruction::SleepOut as u8, DELAY_FLAG,          // wake up
        10,
        Instruction::PixelFormatSet as u8, 1 | DELAY_FLAG, // 16-bit color
        0x55,
        10,
        Instruction::MemoryAccessControl as u8, 1,        // row/col order, BGR
        0x08,
        Instruction::ColumnAddressSet as u8, 4,           // columns 0..=240
        0x00, 0x00, 0x00, 0xF0,
        Instruction::RowAddressSet as u8, 4,              // rows 0..=320
        0x00, 0x00, 0x01, 0x40,
        Instruction::DisplayInversionOn as u8, DELAY_FLAG, // this glass wants it
        10,
        Instruction::NormalDisplayOn as u8, DELAY_FLAG,
        10,
        Instruction::DisplayOn as u8, DELAY_FLAG,
        10,
    ];
}

pub struct ST77XX<SPI, DC, RST, TIMER>
where
    SPI: SpiDevice,
    DC: OutputPin<Error = Infallible>,
    RST: OutputPin<Error = Infallible>,
    TIMER: Timer,
{
    spi: SPI,
    dc: DC,
    rst: RST,
    config: Config,
    rotation: Rotation,
    // Effective start offsets for the current rotation, reloaded from
    // colstart/rowstart on every rotation change.
    xstart: u16,
    ystart: u16,
    invert_on_cmd: u8,
    invert_off_cmd: u8,
    _timer: core::marker::PhantomData<TIMER>,
}

#[maybe_async_cfg::maybe(
    sync(cfg(not(feature = "async")), self = "ST77XX",),
    async(feature = "async", keep_self)
)]
impl<SPI, DC, RST, E, TIMER> ST77XX<SPI, DC, RST, TIMER>
where
    SPI: SpiDevice<Error = E>,
    DC: OutputPin<Error = Infallible>,
    RST: OutputPin<Error = Infallible>,
    TIMER: Timer,
{
    pub fn new(config: Config, spi: SPI, dc: DC, rst: RST) -> Self {
        Self {
            spi,
            dc,
            rst,
            config,
            rotation: Rotation::Deg0,
            xstart: config.colstart,
            ystart: config.rowstart,
            invert_on_cmd: Instruction::DisplayInversionOn as u8,
            invert_off_cmd: Instruction::DisplayInversionOff as u8,
            _timer: core::marker::PhantomData,
        }
    }

    /// Fix the inversion opcodes for this controller family, then bring the
    /// panel out of hardware reset. Bus configuration itself belongs to the
    /// HAL that built the `SpiDevice`.
    pub async fn begin(&mut self) -> Result<(), Error<E>> {
        self.invert_on_cmd = Instruction::DisplayInversionOn as u8;
        self.invert_off_cmd = Instruction::DisplayInversionOff as u8;
        self.reset().await
    }

    /// `begin`, then replay `table` when one is supplied. `None` leaves the
    /// panel at its power-on register defaults.
    pub async fn common_init(&mut self, table: Option<&[u8]>) -> Result<(), Error<E>> {
        self.begin().await?;
        if let Some(table) = table {
            self.run_table(table).await?;
        }
        Ok(())
    }

    pub async fn reset(&mut self) -> Result<(), Error<E>> {
        self.rst.set_high().map_err(Error::Pin)?;
        TIMER::delay_ms(10).await;
        self.rst.set_low().map_err(Error::Pin)?;
        TIMER::delay_ms(10).await;
        self.rst.set_high().map_err(Error::Pin)?;
        TIMER::delay_ms(120).await; // Wait for reset to complete

        Ok(())
    }

    /// Replay a byte-encoded command table: each record is issued as one
    /// command write plus one data write for its arguments, followed by the
    /// encoded settle delay. Every write is its own bus transaction, so the
    /// chip is deselected between commands, which some panel variants
    /// require before they latch a command.
    pub async fn run_table<S: ByteSource>(&mut self, table: S) -> Result<(), Error<E>> {
        let reader = TableReader::new(table);
        #[cfg(feature = "defmt")]
        defmt::debug!("replaying command table: {} commands", reader.remaining());
        for command in reader {
            self.write_command(command.opcode, command.args()).await?;
            if let Some(ms) = command.delay_ms() {
                TIMER::delay_ms(u64::from(ms)).await;
            }
        }
        Ok(())
    }

    /// Enable or disable panel-wide color inversion.
    pub async fn invert_display(&mut self, inverted: bool) -> Result<(), Error<E>> {
        let cmd = if inverted {
            self.invert_on_cmd
        } else {
            self.invert_off_cmd
        };
        self.write_command(cmd, &[]).await
    }

    /// Record new panel start offsets. They are picked up by the next
    /// `set_rotation` call, never retroactively.
    pub fn set_col_row_start(&mut self, col: u16, row: u16) {
        self.config.colstart = col;
        self.config.rowstart = row;
    }

    /// Select the quadrant orientation; `index` wraps modulo 4. Transmits
    /// the mapped MADCTL byte immediately; the start offsets and recorded
    /// rotation follow once the write has gone through.
    pub async fn set_rotation(&mut self, index: u8) -> Result<(), Error<E>> {
        let rotation = Rotation::from_index(index);
        let entry = &ROTATION_TABLE[rotation as usize];
        self.write_command(Instruction::MemoryAccessControl as u8, &[entry.madctl])
            .await?;
        if entry.swap_offsets {
            self.xstart = self.config.rowstart;
            self.ystart = self.config.colstart;
        } else {
            self.xstart = self.config.colstart;
            self.ystart = self.config.rowstart;
        }
        self.rotation = rotation;
        Ok(())
    }

    /// Get current rotation
    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    /// Logical screen dimensions under the current rotation.
    pub fn dimensions(&self) -> (u16, u16) {
        match self.rotation {
            Rotation::Deg0 | Rotation::Deg180 => (self.config.width, self.config.height),
            Rotation::Deg90 | Rotation::Deg270 => (self.config.height, self.config.width),
        }
    }

    /// Program the drawing window and prime the controller for pixel data.
    ///
    /// The start offsets for the current rotation are applied here. Each
    /// axis is packed as `(start << 16) | end` and sent as the four-byte
    /// big-endian payload of the address-set command. Coordinates are not
    /// range-checked against the panel; a degenerate window wraps and is
    /// sent to the hardware as-is.
    pub async fn set_addr_window(
        &mut self,
        x: u16,
        y: u16,
        w: u16,
        h: u16,
    ) -> Result<(), Error<E>> {
        let xs = x.wrapping_add(self.xstart);
        let xe = xs.wrapping_add(w).wrapping_sub(1);
        let ys = y.wrapping_add(self.ystart);
        let ye = ys.wrapping_add(h).wrapping_sub(1);
        let xa = (u32::from(xs) << 16) | u32::from(xe);
        let ya = (u32::from(ys) << 16) | u32::from(ye);

        self.write_command(Instruction::ColumnAddressSet as u8, &xa.to_be_bytes())
            .await?;
        self.write_command(Instruction::RowAddressSet as u8, &ya.to_be_bytes())
            .await?;
        self.write_command(Instruction::MemoryWrite as u8, &[]).await
    }

    /// Write command with optional parameters
    async fn write_command(&mut self, cmd: u8, params: &[u8]) -> Result<(), Error<E>> {
        // Set DC low for command
        self.dc.set_low().map_err(Error::Pin)?;
        self.spi.write(&[cmd]).await.map_err(Error::Comm)?;

        // Write parameters if any
        if !params.is_empty() {
            self.dc.set_high().map_err(Error::Pin)?;
            self.spi.write(params).await.map_err(Error::Comm)?;
        }
        Ok(())
    }

    /// Write raw, already-encoded pixel bytes to a primed window (data mode)
    pub async fn write_pixels(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        self.dc.set_high().map_err(Error::Pin)?;
        self.spi.write(data).await.map_err(Error::Comm)
    }

    /// Stream colors to a primed window as big-endian RGB565, chunked
    /// through a small stack buffer.
    pub async fn write_colors<I>(&mut self, colors: I) -> Result<(), Error<E>>
    where
        I: IntoIterator<Item = Rgb565>,
    {
        let mut chunk = [0u8; 32];
        let mut used = 0;
        for color in colors {
            let bytes = RawU16::from(color).into_inner().to_be_bytes();
            chunk[used] = bytes[0];
            chunk[used + 1] = bytes[1];
            used += 2;
            if used == chunk.len() {
                self.write_pixels(&chunk).await?;
                used = 0;
            }
        }
        if used > 0 {
            self.write_pixels(&chunk[..used]).await?;
        }
        Ok(())
    }
}

#[maybe_async_cfg::maybe(
    sync(cfg(not(feature = "async")), self = "Timer",),
    async(feature = "async", keep_self)
)]
/// Simplified timer trait for delay operations.
pub trait Timer {
    /// Delay for the specified number of milliseconds.
    async fn delay_ms(milliseconds: u64);
}

/// Timer backed by `embassy-time`.
#[cfg(feature = "embassy-time")]
pub struct EmbassyTimer;

#[cfg(all(feature = "embassy-time", feature = "async"))]
impl Timer for EmbassyTimer {
    async fn delay_ms(milliseconds: u64) {
        embassy_time::Timer::after_millis(milliseconds).await;
    }
}

#[cfg(all(feature = "embassy-time", not(feature = "async")))]
impl Timer for EmbassyTimer {
    fn delay_ms(milliseconds: u64) {
        embassy_time::block_for(embassy_time::Duration::from_millis(milliseconds));
    }
}
