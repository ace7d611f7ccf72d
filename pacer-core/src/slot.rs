//! Binary slot model.
//!
//! A command buffer is a run of sub-blocks:
//!
//! ```text
//! +--------+--------+--------------------+
//! | len    | type   | payload            |
//! | 1 byte | 1 byte | len - 1 bytes      |
//! +--------+--------+--------------------+
//! ```
//!
//! Each sub-block decodes into one [`Slot`]. The decoder for a type is
//! looked up in a static table indexed by the type byte.

use crate::error::{CoreError, SlotWarning};
use bytes::{BufMut, Bytes, BytesMut};

/// Axes addressable by a single linear move.
pub const MAX_AXES: usize = 15;

/// Largest step count a single slot field can carry.
pub const MAX_SLOT_STEPS: u32 = 65_535;

/// Largest payload a sub-block can carry.
pub const MAX_SLOT_PAYLOAD: usize = 254;

const WIDE_FIELD: u8 = 0x80;
const PRIMARY_AXIS_MASK: u8 = 0x0F;
const HOMING_FLAG: u8 = 0x10;
const MASK_15: u16 = 0x7FFF;

/// Sub-block type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotType {
    Command = 0x01,
    Delay = 0x02,
    BasicLinearMove = 0x03,
    ActiveToolhead = 0x04,
}

/// One queued primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// An order executed when the slot reaches the head of the queue.
    Command { order: u8, params: Bytes },
    /// Pause in microseconds.
    Delay { micros: u32 },
    BasicLinearMove(BasicLinearMove),
    /// Selects the toolhead later moves apply to.
    ActiveToolhead { index: u8 },
}

type SlotDecoder = fn(&[u8]) -> Result<Slot, CoreError>;

static SLOT_DECODERS: [Option<SlotDecoder>; 5] = [
    None,
    Some(decode_command),
    Some(decode_delay),
    Some(decode_linear_move),
    Some(decode_toolhead),
];

fn decode_command(payload: &[u8]) -> Result<Slot, CoreError> {
    let (&order, params) = payload
        .split_first()
        .ok_or(CoreError::MalformedSlot("command slot without order"))?;
    Ok(Slot::Command {
        order,
        params: Bytes::copy_from_slice(params),
    })
}

fn decode_delay(payload: &[u8]) -> Result<Slot, CoreError> {
    let bytes: [u8; 4] = payload
        .try_into()
        .map_err(|_| CoreError::MalformedSlot("delay slot must carry 4 bytes"))?;
    Ok(Slot::Delay {
        micros: u32::from_be_bytes(bytes),
    })
}

fn decode_linear_move(payload: &[u8]) -> Result<Slot, CoreError> {
    BasicLinearMove::decode_payload(payload).map(Slot::BasicLinearMove)
}

fn decode_toolhead(payload: &[u8]) -> Result<Slot, CoreError> {
    match payload {
        [index] => Ok(Slot::ActiveToolhead { index: *index }),
        _ => Err(CoreError::MalformedSlot(
            "toolhead slot must carry 1 byte",
        )),
    }
}

impl Slot {
    pub fn slot_type(&self) -> SlotType {
        match self {
            Slot::Command { .. } => SlotType::Command,
            Slot::Delay { .. } => SlotType::Delay,
            Slot::BasicLinearMove(_) => SlotType::BasicLinearMove,
            Slot::ActiveToolhead { .. } => SlotType::ActiveToolhead,
        }
    }

    /// Decodes the sub-block at the front of `buf`.
    ///
    /// Returns the slot and the number of bytes consumed.
    pub fn decode_block(buf: &[u8]) -> Result<(Self, usize), CoreError> {
        let (&len, rest) = buf
            .split_first()
            .ok_or(CoreError::MalformedSlot("empty block"))?;
        if len == 0 {
            return Err(CoreError::MalformedSlot("zero length"));
        }
        let len = len as usize;
        if len > rest.len() {
            return Err(CoreError::MalformedSlot("length past end of buffer"));
        }

        let slot_type = rest[0];
        let payload = &rest[1..len];
        let decoder = SLOT_DECODERS
            .get(slot_type as usize)
            .copied()
            .flatten()
            .ok_or(CoreError::MalformedSlot("unknown slot type"))?;

        Ok((decoder(payload)?, len + 1))
    }

    /// Appends this slot as a sub-block.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CoreError> {
        let mut payload = BytesMut::with_capacity(16);
        match self {
            Slot::Command { order, params } => {
                payload.put_u8(*order);
                payload.put_slice(params);
            }
            Slot::Delay { micros } => payload.put_u32(*micros),
            Slot::BasicLinearMove(linear) => linear.encode_payload(&mut payload)?,
            Slot::ActiveToolhead { index } => payload.put_u8(*index),
        }

        if payload.len() > MAX_SLOT_PAYLOAD {
            return Err(CoreError::SlotTooLarge {
                size: payload.len(),
            });
        }

        buf.put_u8(payload.len() as u8 + 1);
        buf.put_u8(self.slot_type() as u8);
        buf.put_slice(&payload);
        Ok(())
    }

    /// Encodes this slot as a standalone sub-block.
    pub fn to_bytes(&self) -> Result<Bytes, CoreError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Validation warnings; only linear moves carry checked fields.
    pub fn validate(&self) -> Vec<SlotWarning> {
        match self {
            Slot::BasicLinearMove(linear) => linear.validate(),
            _ => Vec::new(),
        }
    }
}

/// A coordinated move of up to 15 axes on one controller.
///
/// Speeds are fractions of the controller's step-rate ceiling, 255 being
/// full rate. Step counts are signed; a non-negative count is encoded
/// with its direction bit set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicLinearMove {
    pub primary_axis: u8,
    pub homing: bool,
    pub nominal_speed: u8,
    pub end_speed: u8,
    pub acceleration_steps: u16,
    pub deceleration_steps: u16,
    axis_mask: u16,
    steps: [i32; MAX_AXES],
}

impl BasicLinearMove {
    pub fn new(primary_axis: u8) -> Self {
        Self {
            primary_axis,
            ..Default::default()
        }
    }

    /// Selects `axis` and sets its signed step count.
    pub fn set_axis(&mut self, axis: u8, steps: i32) -> Result<(), CoreError> {
        if axis as usize >= MAX_AXES {
            return Err(CoreError::AxisOutOfRange(axis));
        }
        if steps.unsigned_abs() > MAX_SLOT_STEPS {
            return Err(CoreError::StepsOutOfRange {
                axis,
                steps: steps as i64,
            });
        }
        self.axis_mask |= 1 << axis;
        self.steps[axis as usize] = steps;
        Ok(())
    }

    pub fn with_axis(mut self, axis: u8, steps: i32) -> Result<Self, CoreError> {
        self.set_axis(axis, steps)?;
        Ok(self)
    }

    pub fn axis_mask(&self) -> u16 {
        self.axis_mask
    }

    pub fn is_selected(&self, axis: u8) -> bool {
        (axis as usize) < MAX_AXES && self.axis_mask & (1 << axis) != 0
    }

    /// Signed step count of `axis`, if it is selected.
    pub fn steps(&self, axis: u8) -> Option<i32> {
        self.is_selected(axis).then(|| self.steps[axis as usize])
    }

    /// Selected axes with their step counts, in ascending axis order.
    pub fn axes(&self) -> impl Iterator<Item = (u8, i32)> + '_ {
        (0..MAX_AXES as u8).filter_map(move |axis| self.steps(axis).map(|s| (axis, s)))
    }

    /// Direction bits parallel to the axis mask; set means positive.
    pub fn direction_mask(&self) -> u16 {
        self.axes()
            .filter(|(_, steps)| *steps >= 0)
            .fold(0, |mask, (axis, _)| mask | (1 << axis))
    }

    /// Largest step magnitude among the selected axes.
    pub fn max_steps(&self) -> u32 {
        self.axes().map(|(_, s)| s.unsigned_abs()).max().unwrap_or(0)
    }

    pub fn validate(&self) -> Vec<SlotWarning> {
        let mut warnings = Vec::new();

        if self.end_speed > self.nominal_speed {
            warnings.push(SlotWarning::EndSpeedExceedsNominal {
                nominal: self.nominal_speed,
                end: self.end_speed,
            });
        }

        match self.steps(self.primary_axis) {
            Some(steps) => {
                let ramp_steps = self.acceleration_steps as u32 + self.deceleration_steps as u32;
                if steps.unsigned_abs() < ramp_steps {
                    warnings.push(SlotWarning::AccelerationExceedsSteps {
                        primary_steps: steps.unsigned_abs(),
                        ramp_steps,
                    });
                }
            }
            None => warnings.push(SlotWarning::PrimaryAxisNotSelected {
                axis: self.primary_axis,
            }),
        }

        warnings
    }

    /// Writes the bit-packed payload using the narrowest field widths.
    pub fn encode_payload(&self, buf: &mut BytesMut) -> Result<(), CoreError> {
        if self.primary_axis > PRIMARY_AXIS_MASK {
            return Err(CoreError::AxisOutOfRange(self.primary_axis));
        }

        let wide_axes = self.axis_mask > 0x7F;
        let wide_steps = self.max_steps() > 0xFF
            || self.acceleration_steps > 0xFF
            || self.deceleration_steps > 0xFF;
        let directions = self.direction_mask();

        if wide_axes {
            buf.put_u16(0x8000 | self.axis_mask);
            let flag = if wide_steps { 0x8000 } else { 0 };
            buf.put_u16(flag | directions);
        } else {
            buf.put_u8(self.axis_mask as u8);
            let flag = if wide_steps { WIDE_FIELD } else { 0 };
            buf.put_u8(flag | directions as u8);
        }

        let mut flags = self.primary_axis;
        if self.homing {
            flags |= HOMING_FLAG;
        }
        buf.put_u8(flags);
        buf.put_u8(self.nominal_speed);
        buf.put_u8(self.end_speed);

        let put_steps = |buf: &mut BytesMut, value: u32| {
            if wide_steps {
                buf.put_u16(value as u16);
            } else {
                buf.put_u8(value as u8);
            }
        };
        put_steps(buf, self.acceleration_steps as u32);
        put_steps(buf, self.deceleration_steps as u32);
        for (_, steps) in self.axes() {
            put_steps(buf, steps.unsigned_abs());
        }

        Ok(())
    }

    /// Parses the bit-packed payload of a linear move sub-block.
    pub fn decode_payload(payload: &[u8]) -> Result<Self, CoreError> {
        let mut reader = FieldReader { buf: payload };

        let first = reader.u8()?;
        let wide_axes = first & WIDE_FIELD != 0;
        let (axis_mask, directions, wide_steps) = if wide_axes {
            let axis_mask = u16::from_be_bytes([first, reader.u8()?]) & MASK_15;
            let raw = reader.u16()?;
            (axis_mask, raw & MASK_15, raw & 0x8000 != 0)
        } else {
            let raw = reader.u8()?;
            (first as u16, (raw & !WIDE_FIELD) as u16, raw & WIDE_FIELD != 0)
        };

        let flags = reader.u8()?;
        let nominal_speed = reader.u8()?;
        let end_speed = reader.u8()?;
        let acceleration_steps = reader.steps(wide_steps)?;
        let deceleration_steps = reader.steps(wide_steps)?;

        let mut steps = [0i32; MAX_AXES];
        for (axis, slot) in steps.iter_mut().enumerate() {
            if axis_mask & (1 << axis) == 0 {
                continue;
            }
            let count = reader.steps(wide_steps)? as i32;
            *slot = if directions & (1 << axis) != 0 {
                count
            } else {
                -count
            };
        }

        if !reader.buf.is_empty() {
            return Err(CoreError::MalformedSlot("trailing bytes after move"));
        }

        Ok(Self {
            primary_axis: flags & PRIMARY_AXIS_MASK,
            homing: flags & HOMING_FLAG != 0,
            nominal_speed,
            end_speed,
            acceleration_steps,
            deceleration_steps,
            axis_mask,
            steps,
        })
    }
}

struct FieldReader<'a> {
    buf: &'a [u8],
}

impl FieldReader<'_> {
    fn u8(&mut self) -> Result<u8, CoreError> {
        let (&value, rest) = self
            .buf
            .split_first()
            .ok_or(CoreError::MalformedSlot("truncated move"))?;
        self.buf = rest;
        Ok(value)
    }

    fn u16(&mut self) -> Result<u16, CoreError> {
        Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn steps(&mut self, wide: bool) -> Result<u16, CoreError> {
        if wide {
            self.u16()
        } else {
            self.u8().map(u16::from)
        }
    }
}
