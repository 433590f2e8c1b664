//! The flashing sequence: query the bootloader, then erase and write program flash, the boot
//! vector page and configuration flash, and finally restart the device.

use std::path::PathBuf;

use crate::bootloader_info::{BootInfo, BOOT_INFO_LEN};
use crate::builder::RegionBuilder;
use crate::error::{Error, Result};
use crate::flash::{jump_stub, kseg1, BootVectorPolicy, TargetConfig, NOP, STUB_LEN};
use crate::fsm::{transition, Event, State};
use crate::operation::{Operation, Progress};
use crate::packet::{Opcode, Packet};
use crate::planner::{FlashPlan, FlashPlanner};
use crate::region::{MemoryImage, MemoryRegion, RegionKind, ERASED};
use crate::transport::{TransferMode, Transport};
use crate::PACKET_SIZE;

/// Region index of program flash.
pub const PROGRAM_REGION: usize = 0;

/// Region index of the boot vector page.
pub const BOOT_VECTOR_REGION: usize = 1;

/// Region index of configuration flash.
pub const CONFIG_REGION: usize = 2;

/// Where the program image comes from.
enum ImageSource {
    /// Built from the hex file when program flash is prepared.
    HexFile(PathBuf),
    Image(MemoryImage),
    /// Already consumed by program flash preparation.
    Taken,
}

/// Working state of one flashing run.
#[derive(Debug)]
pub struct ProtocolSession {
    state: State,
    region_index: usize,
    boot_info: Option<BootInfo>,

    /// The first four bytes of program flash, captured before anything else is written.
    first_instruction: [u8; 4],

    /// Config flash contents of the hex file, kept for the config region.
    config_image: Option<MemoryRegion>,

    region: Option<MemoryRegion>,
    plan: Option<FlashPlan>,
    page: u16,
    packet: u16,

    region_written: u32,
    written: u64,
    planned: u64,
}

impl ProtocolSession {
    fn new() -> Self {
        Self {
            state: State::Info,
            region_index: PROGRAM_REGION,
            boot_info: None,
            first_instruction: [ERASED; 4],
            config_image: None,
            region: None,
            plan: None,
            page: 0,
            packet: 0,
            region_written: 0,
            written: 0,
            planned: 0,
        }
    }

    /// State whose command is carried out next.
    pub fn state(&self) -> State {
        self.state
    }

    pub fn region_index(&self) -> usize {
        self.region_index
    }

    /// Capabilities reported by the bootloader, once queried.
    pub fn boot_info(&self) -> Option<&BootInfo> {
        self.boot_info.as_ref()
    }

    pub fn first_instruction(&self) -> [u8; 4] {
        self.first_instruction
    }

    /// Region currently being flashed.
    pub fn region(&self) -> Option<&MemoryRegion> {
        self.region.as_ref()
    }

    pub fn plan(&self) -> Option<&FlashPlan> {
        self.plan.as_ref()
    }

    fn progress(&self, state: State) -> Progress {
        Progress {
            state,
            region: self.region_index,
            region_written: self.region_written,
            region_planned: self.plan.map_or(0, |p| p.total_write_bytes),
            written: self.written,
        }
    }
}

/// Drives the bootloader through a complete flashing run. Every call to [`step`] carries out the
/// command of one state; the engine is also an [`Operation`] yielding one [`Progress`] per step.
///
/// [`step`]: #method.step
pub struct ProtocolEngine<'c, T: Transport> {
    transport: T,
    config: &'c TargetConfig,
    source: ImageSource,
    session: ProtocolSession,
    failed: bool,
}

impl<'c, T: Transport> ProtocolEngine<'c, T> {
    /// Flashes a hex file, which is read once program flash is prepared.
    pub fn from_hex_file<P: Into<PathBuf>>(transport: T, config: &'c TargetConfig, path: P) -> Self {
        Self::with_source(transport, config, ImageSource::HexFile(path.into()))
    }

    /// Flashes an image built beforehand. Fails without touching the device if the image holds no
    /// program flash data.
    pub fn with_image(transport: T, config: &'c TargetConfig, image: MemoryImage) -> Result<Self> {
        check_program_data(&image)?;
        Ok(Self::with_source(transport, config, ImageSource::Image(image)))
    }

    fn with_source(transport: T, config: &'c TargetConfig, source: ImageSource) -> Self {
        Self {
            transport,
            config,
            source,
            session: ProtocolSession::new(),
            failed: false,
        }
    }

    pub fn session(&self) -> &ProtocolSession {
        &self.session
    }

    /// Gives back the transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Carries out the current state's command and advances the state machine. Returns the
    /// progress after the step, or `None` once the run is complete.
    pub fn step(&mut self) -> Result<Option<Progress>> {
        let state = self.session.state;
        let event = match state {
            State::Done => return Ok(None),
            State::Info => {
                let response =
                    self.round_trip(Packet::command(Opcode::Info), TransferMode::AwaitResponse)?;
                let info = decode_boot_info(response)?;
                log::info!(
                    "Bootloader {} on {} (revision 0x{:04x})",
                    info.device_descriptor,
                    info.mcu_kind,
                    info.boot_revision
                );
                log::debug!("{:?}", info);
                self.session.boot_info = Some(info);
                Event::Completed
            }
            State::Boot | State::Sync => {
                let opcode = if state == State::Boot {
                    Opcode::Boot
                } else {
                    Opcode::Sync
                };
                self.round_trip(Packet::command(opcode), TransferMode::AwaitResponse)?;
                Event::Completed
            }
            State::Non => {
                self.prepare_region()?;
                Event::Prepared {
                    sync: self.session.region_index == PROGRAM_REGION,
                }
            }
            State::Erase => {
                let page = self.current_plan()?.page(self.session.page);
                self.round_trip(
                    Packet::erase(page.erase_address, 1),
                    TransferMode::AwaitResponse,
                )?;
                Event::Completed
            }
            State::Write => {
                let page = self.current_plan()?.page(self.session.page);
                self.round_trip(
                    Packet::write(page.write_address, page.write_bytes),
                    TransferMode::OutOnly,
                )?;
                self.session.packet = 0;
                Event::Completed
            }
            State::Hex => self.send_data_packet()?,
            State::Reboot => {
                if self.session.region_index < CONFIG_REGION {
                    self.session.region_index += 1;
                    Event::NextRegion
                } else {
                    self.reboot()?;
                    Event::Rebooted
                }
            }
        };

        let next = transition(state, event).ok_or(Error::InvalidTransition { state, event })?;
        if next != state {
            log::debug!("{} -> {} (region {})", state, next, self.session.region_index);
        }
        self.session.state = next;
        Ok(Some(self.session.progress(state)))
    }

    fn round_trip(
        &mut self,
        packet: Packet,
        mode: TransferMode,
    ) -> Result<Option<[u8; PACKET_SIZE]>> {
        let session = &self.session;
        self.transport
            .send_receive(&packet, mode)
            .map_err(|source| Error::Transport {
                state: session.state,
                region: session.region_index,
                source,
            })
    }

    fn current_plan(&self) -> Result<FlashPlan> {
        self.session.plan.ok_or(Error::NoRegion)
    }

    fn boot_info(&self) -> Result<BootInfo> {
        self.session.boot_info.clone().ok_or(Error::NoBootInfo)
    }

    /// Sends the next slice of the region buffer. The last packet of a page waits for the device
    /// to acknowledge the block.
    fn send_data_packet(&mut self) -> Result<Event> {
        let plan = self.current_plan()?;
        let page = plan.page(self.session.page);
        let last_in_page = self.session.packet + 1 >= page.packets;

        let start = page.offset + usize::from(self.session.packet) * PACKET_SIZE;
        let packet = match &self.session.region {
            Some(region) => {
                let data = region.data();
                let end = (start + PACKET_SIZE).min(data.len());
                Packet::data(data.get(start..end).unwrap_or(&[]))
            }
            None => return Err(Error::NoRegion),
        };

        let mode = if last_in_page {
            TransferMode::AwaitResponse
        } else {
            TransferMode::OutOnly
        };
        self.round_trip(packet, mode)?;

        self.session.packet += 1;
        self.session.region_written += PACKET_SIZE as u32;
        self.session.written += PACKET_SIZE as u64;

        Ok(if !last_in_page {
            Event::PacketSent
        } else if self.session.page + 1 < plan.pages() {
            self.session.page += 1;
            Event::PageDone
        } else {
            log::info!(
                "Wrote {} bytes to {}",
                self.session.region_written,
                self.session
                    .region
                    .as_ref()
                    .map_or(RegionKind::ProgramFlash, MemoryRegion::kind)
            );
            Event::RegionDone
        })
    }

    /// Sends the final reboot. The device resets right away, so losing it during the transfer is
    /// the expected outcome.
    fn reboot(&mut self) -> Result<()> {
        let packet = Packet::command(Opcode::Reboot);
        match self.transport.send_receive(&packet, TransferMode::FinalReboot) {
            Ok(_) => log::info!("Device restarting"),
            Err(error) if error.is_disconnect() => {
                log::info!("Device rebooted ({})", error);
            }
            Err(source) => {
                return Err(Error::Transport {
                    state: State::Reboot,
                    region: self.session.region_index,
                    source,
                })
            }
        }
        Ok(())
    }

    /// Builds the buffer and plan of the region `region_index` points at.
    fn prepare_region(&mut self) -> Result<()> {
        let info = self.boot_info()?;

        if self.session.region_index == BOOT_VECTOR_REGION {
            match self.boot_vector_page(&info) {
                Some(region) => {
                    return self.activate(region, &info);
                }
                None => self.session.region_index = CONFIG_REGION,
            }
        }

        let region = match self.session.region_index {
            PROGRAM_REGION => self.program_region()?,
            _ => self.config_region(&info),
        };
        self.activate(region, &info)
    }

    fn activate(&mut self, region: MemoryRegion, info: &BootInfo) -> Result<()> {
        let plan = FlashPlanner::plan(&region, info)?;
        log::debug!(
            "{} at 0x{:08x}: {} pages, {} bytes in {} packets",
            region.kind(),
            plan.write_base,
            plan.pages(),
            plan.total_write_bytes,
            plan.packet_count
        );

        self.session.planned += u64::from(plan.total_write_bytes);
        self.session.region = Some(region);
        self.session.plan = Some(plan);
        self.session.page = 0;
        self.session.packet = 0;
        self.session.region_written = 0;
        Ok(())
    }

    /// Loads the image and captures the first instruction of program flash.
    fn program_region(&mut self) -> Result<MemoryRegion> {
        let image = match std::mem::replace(&mut self.source, ImageSource::Taken) {
            ImageSource::HexFile(path) => {
                log::info!("Loading {}", path.display());
                let image = RegionBuilder::new(self.config).build_file(&path)?;
                check_program_data(&image)?;
                image
            }
            ImageSource::Image(image) => image,
            ImageSource::Taken => return Err(Error::EmptyImage),
        };

        if !image.overflows().is_empty() {
            log::warn!(
                "{} records did not fit their region and were truncated",
                image.overflows().len()
            );
        }

        let program = image
            .flatten(
                RegionKind::ProgramFlash,
                self.config.base_of(RegionKind::ProgramFlash),
            )
            .ok_or(Error::EmptyImage)?;
        self.session.config_image = image.flatten(
            RegionKind::ConfigFlash,
            self.config.base_of(RegionKind::ConfigFlash),
        );

        let data = program.data();
        let len = data.len().min(4);
        self.session.first_instruction[..len].copy_from_slice(&data[..len]);
        log::debug!(
            "First instruction: {:02x?}",
            self.session.first_instruction
        );

        Ok(program)
    }

    /// The erase block near the end of program flash, holding a jump to the recovery vector in its
    /// last bytes. `None` if the page is disabled or would overlap the bootloader.
    fn boot_vector_page(&self, info: &BootInfo) -> Option<MemoryRegion> {
        if self.config.boot_vector_page == BootVectorPolicy::Disabled {
            log::info!("Skipping boot vector page (disabled)");
            return None;
        }

        let erase_block = u32::from(info.erase_block_size);
        let start = match info
            .mcu_flash_size
            .checked_sub(self.config.boot_vector_reserve)
            .and_then(|offset| self.config.program_flash_base.checked_add(offset))
        {
            Some(start) => start,
            None => {
                log::warn!(
                    "Skipping boot vector page: flash size 0x{:08x} has no room for it",
                    info.mcu_flash_size
                );
                return None;
            }
        };
        let boot_start = info.boot_flash_start & 0x1fff_ffff;
        let fits = start
            .checked_add(erase_block)
            .map_or(false, |end| end <= boot_start);
        if erase_block < STUB_LEN as u32 || !fits {
            log::warn!(
                "Skipping boot vector page at 0x{:08x}: it overlaps the bootloader at 0x{:08x}",
                start,
                boot_start
            );
            return None;
        }

        let mut page = vec![ERASED; erase_block as usize];
        let stub_at = page.len() - STUB_LEN;
        page[stub_at..].copy_from_slice(&jump_stub(self.config.recovery_vector));
        Some(MemoryRegion::from_bytes(
            RegionKind::BootVectorPage,
            start,
            page,
        ))
    }

    /// Config flash as the device must see it after flashing: the program's first instruction,
    /// padding no-ops and a jump back into the bootloader, followed by the hex file's config data.
    fn config_region(&mut self, info: &BootInfo) -> MemoryRegion {
        let base = self.config.config_flash_base;
        let preamble = self.config.config_preamble_len.max(4);
        let write_size =
            usize::from(info.write_block_size) * usize::from(self.config.config_write_blocks);
        let len = write_size.max(preamble + STUB_LEN);

        let mut region = self
            .session
            .config_image
            .take()
            .unwrap_or_else(|| MemoryRegion::erased(RegionKind::ConfigFlash, base, base));

        if region.data().len() > len && region.data()[len..].iter().any(|b| *b != ERASED) {
            log::warn!(
                "Config data beyond 0x{:08x} is not written",
                base + len as u32 - 1
            );
        }
        region.resize(len);

        let data = region.data_mut();
        data[..4].copy_from_slice(&self.session.first_instruction);
        for word in data[4..preamble].chunks_mut(4) {
            word.copy_from_slice(&NOP[..word.len()]);
        }
        data[preamble..preamble + STUB_LEN]
            .copy_from_slice(&jump_stub(kseg1(info.boot_flash_start)));
        region
    }
}

fn check_program_data(image: &MemoryImage) -> Result<()> {
    let has_program = image.regions_of(RegionKind::ProgramFlash).next().is_some();
    if !has_program || image.total_data_size() == 0 {
        Err(Error::EmptyImage)
    } else {
        Ok(())
    }
}

impl<T: Transport> Iterator for ProtocolEngine<'_, T> {
    type Item = Result<Progress>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.step() {
            Ok(progress) => progress.map(Ok),
            Err(error) => {
                log::error!(
                    "Flashing failed in state {} (region {}): {}",
                    self.session.state,
                    self.session.region_index,
                    error
                );
                self.failed = true;
                Some(Err(error))
            }
        }
    }
}

impl<T: Transport> Operation for ProtocolEngine<'_, T> {
    fn total(&self) -> u64 {
        self.session.planned
    }
}

/// Queries the bootloader's capabilities without changing anything on the device.
pub fn read_boot_info<T: Transport>(transport: &mut T) -> Result<BootInfo> {
    let response = transport
        .send_receive(&Packet::command(Opcode::Info), TransferMode::AwaitResponse)
        .map_err(|source| Error::Transport {
            state: State::Info,
            region: PROGRAM_REGION,
            source,
        })?;
    decode_boot_info(response)
}

fn decode_boot_info(response: Option<[u8; PACKET_SIZE]>) -> Result<BootInfo> {
    match response {
        Some(block) => BootInfo::decode(&block),
        None => Err(Error::TruncatedResponse {
            expected: BOOT_INFO_LEN,
            actual: 0,
        }),
    }
}
