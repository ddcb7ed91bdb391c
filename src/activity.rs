use serde_derive::Serialize;

use crate::session::{MowerActivity, MowerState, Snapshot};

/// Activity vocabulary of the Home Assistant `lawn_mower` entity.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LawnMowerActivity {
    Mowing,
    Docked,
    Paused,
    Error,
}

/// Maps the mower's own state/activity pair onto the entity activity.
///
/// Returns `None` when there is nothing to derive it from, which the entity
/// reports as unavailable.
pub fn lawn_mower_activity(snapshot: Option<&Snapshot>) -> Option<LawnMowerActivity> {
    let snapshot = snapshot?;
    let state = snapshot.state?;
    let activity = snapshot.activity?;

    let mapped = match state {
        MowerState::Paused => LawnMowerActivity::Paused,
        // Stopped has no entity equivalent
        MowerState::Stopped | MowerState::Off | MowerState::WaitForSafetyPin => {
            LawnMowerActivity::Error
        }
        MowerState::Restricted
        | MowerState::InOperation
        | MowerState::Unknown
        | MowerState::CheckSafety
        | MowerState::PendingStart => match activity {
            MowerActivity::Charging | MowerActivity::Parked | MowerActivity::Idle => {
                LawnMowerActivity::Docked
            }
            MowerActivity::GoingOut | MowerActivity::Mowing | MowerActivity::GoingHome => {
                LawnMowerActivity::Mowing
            }
            MowerActivity::StoppedInGarden => LawnMowerActivity::Error,
        },
        MowerState::FatalError | MowerState::Error => LawnMowerActivity::Error,
    };
    Some(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(state: MowerState, activity: MowerActivity) -> Snapshot {
        Snapshot {
            battery_level: Some(50),
            activity: Some(activity),
            state: Some(state),
        }
    }

    #[test]
    fn test_paused_wins_over_activity() {
        let s = snapshot(MowerState::Paused, MowerActivity::Mowing);
        assert_eq!(lawn_mower_activity(Some(&s)), Some(LawnMowerActivity::Paused));
    }

    #[test]
    fn test_operating_states() {
        let s = snapshot(MowerState::InOperation, MowerActivity::Mowing);
        assert_eq!(lawn_mower_activity(Some(&s)), Some(LawnMowerActivity::Mowing));

        let s = snapshot(MowerState::Restricted, MowerActivity::Charging);
        assert_eq!(lawn_mower_activity(Some(&s)), Some(LawnMowerActivity::Docked));

        let s = snapshot(MowerState::PendingStart, MowerActivity::Idle);
        assert_eq!(lawn_mower_activity(Some(&s)), Some(LawnMowerActivity::Docked));

        let s = snapshot(MowerState::CheckSafety, MowerActivity::GoingHome);
        assert_eq!(lawn_mower_activity(Some(&s)), Some(LawnMowerActivity::Mowing));

        let s = snapshot(MowerState::Unknown, MowerActivity::StoppedInGarden);
        assert_eq!(lawn_mower_activity(Some(&s)), Some(LawnMowerActivity::Error));
    }

    #[test]
    fn test_stopped_states_are_errors() {
        for state in [MowerState::Stopped, MowerState::Off, MowerState::WaitForSafetyPin] {
            let s = snapshot(state, MowerActivity::Parked);
            assert_eq!(lawn_mower_activity(Some(&s)), Some(LawnMowerActivity::Error));
        }
    }

    #[test]
    fn test_missing_data() {
        assert_eq!(lawn_mower_activity(None), None);

        let s = Snapshot {
            battery_level: Some(10),
            activity: None,
            state: Some(MowerState::InOperation),
        };
        assert_eq!(lawn_mower_activity(Some(&s)), None);
    }

    #[test]
    fn test_serialized_name() {
        assert_eq!(
            serde_json::to_string(&LawnMowerActivity::Docked).unwrap(),
            "\"docked\""
        );
    }
}
