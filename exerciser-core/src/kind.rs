//! The closed set of commands the exerciser knows how to build.
//!
//! Every [CommandKind] maps to a static [KindLayout] describing its opcode,
//! data direction, the data placements it may use and its named fields.

use crate::{
    admin_commands::{self, AdminOpcode},
    generic_command::{DataDirection, FieldSpec},
    io_commands::{self, IoOpcode},
    prp::PlacementMask,
};

/// The command set a command is submitted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandSet {
    /// Only valid on the admin queue
    Admin,
    /// Only valid on I/O queues
    Nvm,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandKind {
    Identify,
    GetFeatures,
    SetFeatures,
    GetLogPage,
    CreateIoCompletionQueue,
    CreateIoSubmissionQueue,
    DeleteIoCompletionQueue,
    DeleteIoSubmissionQueue,
    Abort,
    KeepAlive,
    Read,
    Write,
    Flush,
}

/// Static description of a [CommandKind]
#[derive(Debug, Clone, Copy)]
pub struct KindLayout {
    pub opcode: u8,
    pub command_set: CommandSet,
    pub direction: DataDirection,
    /// The widest set of data placements the command may use
    pub placement: PlacementMask,
    /// `true` if dword 1 carries a namespace identifier
    pub namespace_scoped: bool,
    /// Command specific fields
    pub fields: &'static [FieldSpec],
}

const NO_DATA: PlacementMask = PlacementMask::empty();
const CONTIGUOUS: PlacementMask = PlacementMask::FIRST_PAGE;
const TWO_PAGES: PlacementMask = PlacementMask::FIRST_PAGE.union(PlacementMask::SECOND_PAGE);
const ANY_PLACEMENT: PlacementMask = PlacementMask::all();

const fn admin(
    opcode: AdminOpcode,
    direction: DataDirection,
    placement: PlacementMask,
    namespace_scoped: bool,
    fields: &'static [FieldSpec],
) -> KindLayout {
    KindLayout {
        opcode: opcode as u8,
        command_set: CommandSet::Admin,
        direction,
        placement,
        namespace_scoped,
        fields,
    }
}

const fn nvm(
    opcode: IoOpcode,
    direction: DataDirection,
    placement: PlacementMask,
    fields: &'static [FieldSpec],
) -> KindLayout {
    KindLayout {
        opcode: opcode as u8,
        command_set: CommandSet::Nvm,
        direction,
        placement,
        namespace_scoped: true,
        fields,
    }
}

impl CommandKind {
    pub const ALL: [CommandKind; 13] = [
        CommandKind::Identify,
        CommandKind::GetFeatures,
        CommandKind::SetFeatures,
        CommandKind::GetLogPage,
        CommandKind::CreateIoCompletionQueue,
        CommandKind::CreateIoSubmissionQueue,
        CommandKind::DeleteIoCompletionQueue,
        CommandKind::DeleteIoSubmissionQueue,
        CommandKind::Abort,
        CommandKind::KeepAlive,
        CommandKind::Read,
        CommandKind::Write,
        CommandKind::Flush,
    ];

    pub fn layout(self) -> KindLayout {
        use DataDirection::*;
        match self {
            CommandKind::Identify => admin(
                AdminOpcode::Identify,
                DeviceToHost,
                TWO_PAGES,
                true,
                admin_commands::IDENTIFY_FIELDS,
            ),
            CommandKind::GetFeatures => admin(
                AdminOpcode::GetFeatures,
                DeviceToHost,
                TWO_PAGES,
                false,
                admin_commands::GET_FEATURES_FIELDS,
            ),
            CommandKind::SetFeatures => admin(
                AdminOpcode::SetFeatures,
                HostToDevice,
                TWO_PAGES,
                false,
                admin_commands::SET_FEATURES_FIELDS,
            ),
            CommandKind::GetLogPage => admin(
                AdminOpcode::GetLogPage,
                DeviceToHost,
                ANY_PLACEMENT,
                true,
                admin_commands::GET_LOG_PAGE_FIELDS,
            ),
            CommandKind::CreateIoCompletionQueue => admin(
                AdminOpcode::CreateIoCompletionQueue,
                HostToDevice,
                CONTIGUOUS,
                false,
                admin_commands::CREATE_IO_CQ_FIELDS,
            ),
            CommandKind::CreateIoSubmissionQueue => admin(
                AdminOpcode::CreateIoSubmissionQueue,
                HostToDevice,
                CONTIGUOUS,
                false,
                admin_commands::CREATE_IO_SQ_FIELDS,
            ),
            CommandKind::DeleteIoCompletionQueue => admin(
                AdminOpcode::DeleteIoCompletionQueue,
                None,
                NO_DATA,
                false,
                admin_commands::DELETE_IO_QUEUE_FIELDS,
            ),
            CommandKind::DeleteIoSubmissionQueue => admin(
                AdminOpcode::DeleteIoSubmissionQueue,
                None,
                NO_DATA,
                false,
                admin_commands::DELETE_IO_QUEUE_FIELDS,
            ),
            CommandKind::Abort => admin(
                AdminOpcode::Abort,
                None,
                NO_DATA,
                false,
                admin_commands::ABORT_FIELDS,
            ),
            CommandKind::KeepAlive => admin(AdminOpcode::KeepAlive, None, NO_DATA, false, &[]),
            CommandKind::Read => nvm(
                IoOpcode::Read,
                DeviceToHost,
                ANY_PLACEMENT,
                io_commands::READ_WRITE_FIELDS,
            ),
            CommandKind::Write => nvm(
                IoOpcode::Write,
                HostToDevice,
                ANY_PLACEMENT,
                io_commands::READ_WRITE_FIELDS,
            ),
            CommandKind::Flush => nvm(IoOpcode::Flush, None, NO_DATA, &[]),
        }
    }

    /// The kind for `opcode` within `command_set`, if it is a known kind
    pub fn from_opcode(command_set: CommandSet, opcode: u8) -> Option<CommandKind> {
        Self::ALL.into_iter().find(|kind| {
            let layout = kind.layout();
            layout.command_set == command_set && layout.opcode == opcode
        })
    }

    /// Looks up a named field of this kind
    pub fn field(self, name: &str) -> Option<&'static FieldSpec> {
        self.layout().fields.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::generic_command::CommandBuffer;

    #[test]
    fn direction_matches_opcode_bits() {
        for kind in CommandKind::ALL {
            let layout = kind.layout();
            let bits = DataDirection::try_from(layout.opcode & 0b11).unwrap();
            assert_eq!(bits, layout.direction, "{kind:?}");
            assert_eq!(
                layout.direction == DataDirection::None,
                layout.placement.is_empty(),
                "{kind:?}"
            );
        }
    }

    #[test]
    fn opcode_lookup() {
        for kind in CommandKind::ALL {
            let layout = kind.layout();
            assert_eq!(
                CommandKind::from_opcode(layout.command_set, layout.opcode),
                Some(kind)
            );
        }
        assert_eq!(
            CommandKind::from_opcode(CommandSet::Admin, 0x06),
            Some(CommandKind::Identify)
        );
        assert_eq!(
            CommandKind::from_opcode(CommandSet::Nvm, 0x02),
            Some(CommandKind::Read)
        );
        assert_eq!(CommandKind::from_opcode(CommandSet::Admin, 0xff), None);
    }

    #[test]
    fn for_kind_presets_header() {
        let command = CommandBuffer::for_kind(CommandKind::Identify).unwrap();
        assert_eq!(command.len(), 64);
        assert_eq!(command.opcode(), 0x06);
        assert_eq!(command.direction(), DataDirection::DeviceToHost);
        assert_eq!(command.authorized_placement(), TWO_PAGES);
        assert_eq!(command.kind(), Some(CommandKind::Identify));
    }

    #[test]
    fn named_fields() {
        let mut command = CommandBuffer::for_kind(CommandKind::GetFeatures).unwrap();
        let fid = CommandKind::GetFeatures.field("FID").unwrap();
        command.set_field(fid, 0x07).unwrap();
        assert_eq!(command.get_byte(10, 0).unwrap(), 0x07);
        assert!(CommandKind::KeepAlive.field("FID").is_none());
    }
}
