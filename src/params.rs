//! Acquisition parameters and the store that programs them.
//!
//! [`normalize`] is the only way a proposed [`AcquisitionParams`] becomes a
//! committed one: it rounds and range-checks every field against the board's
//! [`FamilyDescriptor`]. [`ParamStore`] keeps the committed value together with
//! the snapshot last written to hardware, so [`ParamStore::apply`] programs only
//! the registers whose words changed.

use dragon_regs::{
    FamilyDescriptor, MiscBits, Register, SWITCH_PERIOD_MAX, SYNC_OFFSET_MAX, SYNC_WIDTH_MAX,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ParamError;
use crate::hardware::RegisterInterface;

/// Acquisition configuration.
///
/// Fields a board generation does not implement are ignored and normalized to
/// zero/false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionParams {
    /// Bytes per frame; a multiple of the family packet unit.
    pub frame_length: u32,
    /// Frames the board writes into one buffer.
    pub frames_per_buffer: u32,
    /// Half-sample shift.
    pub half_shift: bool,
    /// Alternate channels automatically.
    pub channel_auto: bool,
    /// Manual channel select.
    pub channel: bool,
    /// Sync offset in ticks, `0..=511`.
    pub sync_offset: u32,
    /// Sync width in ticks, `0..=127`.
    pub sync_width: u32,
    /// Raw DAC word.
    pub dac_data: u32,
    /// Packet120 only.
    pub pulse_mask: u32,
    /// Legacy only: frames between input switch toggles.
    pub switch_period: u32,
    /// Legacy only.
    pub switch_auto: bool,
    /// Legacy only.
    pub switch_state: bool,
}

impl AcquisitionParams {
    /// Factory values for a board generation.
    pub fn defaults(desc: &FamilyDescriptor) -> Self {
        let d = desc.defaults;
        Self {
            frame_length: d.frame_length,
            frames_per_buffer: d.frames_per_buffer,
            half_shift: false,
            channel_auto: false,
            channel: false,
            sync_offset: 0,
            sync_width: d.sync_width,
            dac_data: 0,
            pulse_mask: d.pulse_mask,
            switch_period: d.switch_period,
            switch_auto: false,
            switch_state: false,
        }
    }

    /// Bytes the board writes per buffer.
    pub fn buffer_bytes(&self) -> usize {
        self.frame_length as usize * self.frames_per_buffer as usize
    }

    fn misc(&self) -> MiscBits {
        MiscBits {
            sync_width: self.sync_width,
            channel: self.channel,
            channel_auto: self.channel_auto,
            half_shift: self.half_shift,
            sync_offset: self.sync_offset,
            switch_auto: self.switch_auto,
            switch_state: self.switch_state,
        }
    }

    /// Register words that encode these parameters on `desc`, in programming order.
    pub fn register_words(&self, desc: &FamilyDescriptor) -> Vec<(Register, u32)> {
        let mut words = vec![
            (Register::FrameLength, desc.frame_length_word(self.frame_length)),
            (
                Register::FramesPerBuffer,
                desc.frames_per_buffer_word(self.frames_per_buffer, self.frame_length),
            ),
            (Register::Misc, self.misc().pack()),
        ];
        if desc.capabilities.input_switch {
            words.push((Register::SwitchPeriod, self.switch_period));
        }
        if desc.capabilities.pulse_mask {
            words.push((Register::PulseMask, self.pulse_mask));
        }
        words.push((Register::Dac, self.dac_data));
        words
    }
}

impl Default for AcquisitionParams {
    fn default() -> Self {
        Self::defaults(dragon_regs::DeviceFamily::Legacy.descriptor())
    }
}

/// Validates `proposed` against `desc` and returns the normalized value.
///
/// - `frame_length` must be in `min_frame_length..=max_frame_length` and is
///   rounded up to the packet unit.
/// - `frames_per_buffer` must be non-zero, at most the family maximum, and keep
///   `frame_length * frames_per_buffer` within the per-buffer ceiling.
/// - Legacy `switch_period` must be in `1..=2^24`. It is rounded up to a
///   multiple of `frames_per_buffer`, or down when rounding up would pass 2^24.
///
/// The result always normalizes to itself.
pub fn normalize(
    desc: &FamilyDescriptor,
    proposed: &AcquisitionParams,
) -> Result<AcquisitionParams, ParamError> {
    let mut p = *proposed;

    let frame_length = (proposed.frame_length >= desc.min_frame_length)
        .then(|| desc.round_frame_length(proposed.frame_length))
        .flatten()
        .filter(|&fl| fl <= desc.max_frame_length)
        .ok_or(ParamError::FrameLength {
            value: proposed.frame_length,
            min: desc.min_frame_length,
            max: desc.max_frame_length,
        })?;
    p.frame_length = frame_length;

    let bytes = u64::from(p.frame_length) * u64::from(p.frames_per_buffer);
    if p.frames_per_buffer == 0
        || p.frames_per_buffer > desc.max_frames_per_buffer
        || bytes > u64::from(desc.max_data_in_buffer)
    {
        return Err(ParamError::FramesPerBuffer {
            value: p.frames_per_buffer,
            max: desc.max_frames_per_buffer,
            bytes,
            ceiling: desc.max_data_in_buffer,
        });
    }

    if p.sync_offset > SYNC_OFFSET_MAX {
        return Err(ParamError::SyncOffset {
            value: p.sync_offset,
            max: SYNC_OFFSET_MAX,
        });
    }
    if p.sync_width > SYNC_WIDTH_MAX {
        return Err(ParamError::SyncWidth {
            value: p.sync_width,
            max: SYNC_WIDTH_MAX,
        });
    }

    if desc.capabilities.input_switch {
        if p.switch_period == 0 || p.switch_period > SWITCH_PERIOD_MAX {
            return Err(ParamError::SwitchPeriod {
                value: p.switch_period,
                max: SWITCH_PERIOD_MAX,
            });
        }
        p.switch_period = switch_period_multiple(p.switch_period, p.frames_per_buffer);
    } else {
        p.switch_period = 0;
        p.switch_auto = false;
        p.switch_state = false;
    }
    if !desc.capabilities.pulse_mask {
        p.pulse_mask = 0;
    }

    Ok(p)
}

/// Nearest multiple of `fpb` at or above `period`, stepping down one
/// multiple if that passes [`SWITCH_PERIOD_MAX`].
fn switch_period_multiple(period: u32, fpb: u32) -> u32 {
    let up = period.div_ceil(fpb) * fpb;
    if up > SWITCH_PERIOD_MAX {
        SWITCH_PERIOD_MAX / fpb * fpb
    } else {
        up
    }
}

/// Committed parameters plus the snapshot last programmed into the board.
#[derive(Debug)]
pub struct ParamStore {
    desc: &'static FamilyDescriptor,
    current: AcquisitionParams,
    applied: Option<AcquisitionParams>,
}

impl ParamStore {
    /// Store holding the factory values for `desc`, with nothing applied yet.
    pub fn new(desc: &'static FamilyDescriptor) -> Self {
        Self {
            desc,
            current: Self::factory(desc),
            applied: None,
        }
    }

    /// Factory values passed through [`normalize`]; the legacy switch period
    /// becomes a whole number of buffers.
    fn factory(desc: &FamilyDescriptor) -> AcquisitionParams {
        let raw = AcquisitionParams::defaults(desc);
        normalize(desc, &raw).unwrap_or(raw)
    }

    /// Board generation the store validates against.
    pub fn descriptor(&self) -> &'static FamilyDescriptor {
        self.desc
    }

    /// Committed parameters.
    pub fn current(&self) -> AcquisitionParams {
        self.current
    }

    /// Normalized factory parameters.
    pub fn defaults(&self) -> AcquisitionParams {
        Self::factory(self.desc)
    }

    /// Validates and commits `proposed`; nothing is written to hardware.
    ///
    /// On error the committed value is unchanged.
    pub fn set(&mut self, proposed: &AcquisitionParams) -> Result<AcquisitionParams, ParamError> {
        let normalized = normalize(self.desc, proposed)?;
        self.current = normalized;
        Ok(normalized)
    }

    /// Restores factory values and forgets the applied snapshot, so the next
    /// [`ParamStore::apply`] programs every register.
    pub fn reset_session(&mut self) {
        self.current = self.defaults();
        self.applied = None;
    }

    /// Register writes needed to move the board from the applied snapshot to
    /// the committed value.
    pub fn pending_writes(&self) -> Vec<(Register, u32)> {
        let target = self.current.register_words(self.desc);
        match &self.applied {
            None => target,
            Some(applied) => {
                let old = applied.register_words(self.desc);
                target
                    .into_iter()
                    .filter(|w| !old.contains(w))
                    .collect()
            }
        }
    }

    /// Programs the pending writes and records the committed value as applied.
    ///
    /// Callers gate this on the device being inactive.
    pub fn apply(&mut self, regs: &dyn RegisterInterface) -> usize {
        let writes = self.pending_writes();
        for &(reg, value) in &writes {
            regs.write_register(reg, value);
        }
        debug!(registers = writes.len(), "acquisition parameters applied");
        self.applied = Some(self.current);
        writes.len()
    }

    /// Writes the DAC register directly and keeps both snapshots in step.
    pub fn write_dac(&mut self, regs: &dyn RegisterInterface, value: u32) {
        regs.write_register(Register::Dac, value);
        self.current.dac_data = value;
        if let Some(applied) = self.applied.as_mut() {
            applied.dac_data = value;
        }
    }
}
