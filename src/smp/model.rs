//! Association model selection.
//!
//! Implements the table from Vol 3 Part H Section 2.3.5.1 (legacy) and the equivalent
//! Secure Connections mapping in Section 2.3.5.6, collapsed into a single function
//! since both tables key off the same IO capability pair plus an MITM/OOB gate.

use crate::smp::codec::IoCapability;

/// The negotiated association model for one pairing attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AssociationModel {
    /// No user interaction; confirm values are not displayed or compared.
    JustWorks,
    /// Both sides display a 6-digit number and the user confirms they match.
    NumericComparison,
    /// One side displays a passkey, the other enters it (or both enter the same
    /// externally-provisioned value). Runs for 20 rounds of commitment exchange
    /// under Secure Connections.
    PasskeyEntry { initiator_displays: bool },
    /// Authentication material was exchanged out-of-band before pairing started.
    OutOfBand,
}

/// Picks the association model for a pairing attempt.
///
/// `oob_present` being true always selects [`AssociationModel::OutOfBand`] regardless
/// of IO capabilities, per the core spec's precedence rule. When neither side requires
/// MITM protection, `JustWorks` is always selected even if both support richer models,
/// since there would be nothing to protect against.
pub fn select_association_model(
    initiator_io: IoCapability,
    responder_io: IoCapability,
    mitm_required: bool,
    oob_present: bool,
) -> AssociationModel {
    if oob_present {
        return AssociationModel::OutOfBand;
    }
    if !mitm_required {
        return AssociationModel::JustWorks;
    }

    use IoCapability::*;
    match (initiator_io, responder_io) {
        (NoInputNoOutput, _) | (_, NoInputNoOutput) => AssociationModel::JustWorks,
        (DisplayYesNo, DisplayYesNo) => AssociationModel::NumericComparison,
        (DisplayOnly, DisplayYesNo) | (KeyboardDisplay, DisplayYesNo) => {
            AssociationModel::NumericComparison
        }
        (DisplayYesNo, DisplayOnly) | (DisplayYesNo, KeyboardDisplay) => {
            AssociationModel::NumericComparison
        }
        (KeyboardOnly, KeyboardOnly) => AssociationModel::PasskeyEntry {
            initiator_displays: false,
        },
        (KeyboardOnly, _) => AssociationModel::PasskeyEntry {
            initiator_displays: false,
        },
        (_, KeyboardOnly) => AssociationModel::PasskeyEntry {
            initiator_displays: true,
        },
        (KeyboardDisplay, KeyboardDisplay) => AssociationModel::PasskeyEntry {
            initiator_displays: true,
        },
        (DisplayOnly, DisplayOnly) => AssociationModel::JustWorks,
        (DisplayOnly, KeyboardDisplay) => AssociationModel::PasskeyEntry {
            initiator_displays: false,
        },
        (KeyboardDisplay, DisplayOnly) => AssociationModel::PasskeyEntry {
            initiator_displays: true,
        },
        (Unknown(_), _) | (_, Unknown(_)) => AssociationModel::JustWorks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use IoCapability::*;

    #[test]
    fn no_mitm_is_always_just_works() {
        assert_eq!(
            select_association_model(DisplayYesNo, DisplayYesNo, false, false),
            AssociationModel::JustWorks
        );
    }

    #[test]
    fn oob_wins_regardless_of_io() {
        assert_eq!(
            select_association_model(NoInputNoOutput, NoInputNoOutput, true, true),
            AssociationModel::OutOfBand
        );
    }

    #[test]
    fn both_display_yes_no_is_numeric_comparison() {
        assert_eq!(
            select_association_model(DisplayYesNo, DisplayYesNo, true, false),
            AssociationModel::NumericComparison
        );
    }

    #[test]
    fn keyboard_only_responder_means_initiator_displays() {
        assert_eq!(
            select_association_model(DisplayOnly, KeyboardOnly, true, false),
            AssociationModel::PasskeyEntry {
                initiator_displays: true
            }
        );
    }

    #[test]
    fn no_input_no_output_forces_just_works() {
        assert_eq!(
            select_association_model(NoInputNoOutput, KeyboardDisplay, true, false),
            AssociationModel::JustWorks
        );
    }
}
