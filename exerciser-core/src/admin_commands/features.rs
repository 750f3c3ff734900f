use bit_field::BitField;
use shared_derive::U8Enum;

use crate::{
    generic_command::{CommandBuffer, FieldError, FieldSpec},
    kind::CommandKind,
};

pub const FEATURE_ID: FieldSpec = FieldSpec::new("FID", 10, 0, 7);
pub const FEATURE_SELECT: FieldSpec = FieldSpec::new("SEL", 10, 8, 10);
pub const FEATURE_SAVE: FieldSpec = FieldSpec::new("SV", 10, 31, 31);
pub const FEATURE_VALUE: FieldSpec = FieldSpec::dword("VALUE", 11);
pub const GET_FEATURES_FIELDS: &[FieldSpec] = &[FEATURE_ID, FEATURE_SELECT, FEATURE_VALUE];
pub const SET_FEATURES_FIELDS: &[FieldSpec] = &[FEATURE_ID, FEATURE_SAVE, FEATURE_VALUE];

/// See: NVM Express Base Spec: Figure 317: Feature Identifiers
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, U8Enum)]
pub enum FeatureIdentifier {
    Arbitration = 0x1,
    PowerManagement = 0x2,
    TemperatureThreshold = 0x4,
    VolatileWriteCache = 0x6,
    NumberOfQueues = 0x7,
    InterruptCoalescing = 0x8,
    InterruptVectorConfiguration = 0x9,
    AsynchronousEventConfiguration = 0xb,
    KeepAliveTimer = 0xf,
    IoCommandSetProfile = 0x19,
}

/// Which value a get features command reports
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, U8Enum)]
pub enum FeatureSelect {
    Current = 0b000,
    Default = 0b001,
    Saved = 0b010,
    SupportedCapabilities = 0b011,
}

/// Typed values for the features the exerciser sets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum SetFeatureData {
    /// Counts are 1 based, they are converted to the 0 based wire format
    NumberOfQueues { sub_count: u16, comp_count: u16 },
    VolatileWriteCache { enable: bool },
    /// Any feature with a raw dword 11 value
    Raw { identifier: u8, value: u32 },
}

impl SetFeatureData {
    pub fn identifier(&self) -> u8 {
        match self {
            SetFeatureData::NumberOfQueues { .. } => FeatureIdentifier::NumberOfQueues.into(),
            SetFeatureData::VolatileWriteCache { .. } => {
                FeatureIdentifier::VolatileWriteCache.into()
            }
            SetFeatureData::Raw { identifier, .. } => *identifier,
        }
    }

    /// The dword 11 value
    pub fn value(&self) -> u32 {
        match *self {
            SetFeatureData::NumberOfQueues {
                sub_count,
                comp_count,
            } => number_of_queues_value(sub_count, comp_count),
            SetFeatureData::VolatileWriteCache { enable } => enable as u32,
            SetFeatureData::Raw { value, .. } => value,
        }
    }
}

/// Encodes 1 based queue counts into the 0 based number of queues value
pub fn number_of_queues_value(sub_count: u16, comp_count: u16) -> u32 {
    let mut value = 0u32;
    value.set_bits(0..=15, sub_count.saturating_sub(1) as u32);
    value.set_bits(16..=31, comp_count.saturating_sub(1) as u32);
    value
}

/// Decodes a number of queues value into 1 based `(submission, completion)`
/// counts
pub fn decode_number_of_queues(value: u32) -> (u32, u32) {
    (
        value.get_bits(0..=15) + 1,
        value.get_bits(16..=31) + 1,
    )
}

/// Create the [CommandBuffer] for a get features command
///
/// See: NVM Express Base Spec: 5.15
pub fn get_features(feature: u8, select: FeatureSelect) -> Result<CommandBuffer, FieldError> {
    let mut command = CommandBuffer::for_kind(CommandKind::GetFeatures)?;
    command.set_field(&FEATURE_ID, feature as u32)?;
    command.set_field(&FEATURE_SELECT, u8::from(select) as u32)?;
    Ok(command)
}

/// Create the [CommandBuffer] for a set features command
///
/// See: NVM Express Base Spec: 5.27
pub fn set_features(feature: SetFeatureData, save: bool) -> Result<CommandBuffer, FieldError> {
    let mut command = CommandBuffer::for_kind(CommandKind::SetFeatures)?;
    command.set_field(&FEATURE_ID, feature.identifier() as u32)?;
    command.set_field(&FEATURE_SAVE, save as u32)?;
    command.set_field(&FEATURE_VALUE, feature.value())?;
    Ok(command)
}
