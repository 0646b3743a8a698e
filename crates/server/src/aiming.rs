//! Object aiming: aligning a mesh-modelled object against its physical
//! counterpart by recording the robot end effector at each of the
//! mesh's focus points.
//!
//! One armed session per user. The table only tracks state; lock
//! checks, pose reads and the focus call live with the RPC handlers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use arcor_domain::math::Pose;
use arcor_domain::{Error, Result};

/// The robot (and end effector) doing the aiming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotTarget {
    pub robot_id: String,
    pub end_effector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arm_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AimingSession {
    pub object_id: String,
    pub robot: RobotTarget,
    /// One slot per mesh focus point.
    pub poses: Vec<Option<Pose>>,
    pub started: Instant,
}

impl AimingSession {
    pub fn missing(&self) -> usize {
        self.poses.iter().filter(|p| p.is_none()).count()
    }

    pub fn recorded(&self) -> Vec<Pose> {
        self.poses.iter().filter_map(|p| *p).collect()
    }
}

#[derive(Default)]
pub struct AimingTable {
    /// user → armed session.
    sessions: Mutex<HashMap<String, AimingSession>>,
}

impl AimingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, user: &str, object_id: &str, robot: RobotTarget, points: usize) -> Result<()> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(user) {
            return Err(Error::State("Aiming already armed.".to_owned()));
        }
        if sessions.values().any(|s| s.object_id == object_id) {
            return Err(Error::State(format!(
                "Object {object_id} is already being aimed."
            )));
        }
        sessions.insert(
            user.to_owned(),
            AimingSession {
                object_id: object_id.to_owned(),
                robot,
                poses: vec![None; points],
                started: Instant::now(),
            },
        );
        Ok(())
    }

    pub fn get(&self, user: &str) -> Result<AimingSession> {
        self.sessions
            .lock()
            .get(user)
            .cloned()
            .ok_or_else(|| Error::State("Aiming not armed.".to_owned()))
    }

    /// Validate a point index without recording anything (dry run and
    /// the pre-await check share this).
    pub fn check_point(&self, user: &str, index: i64) -> Result<()> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(user)
            .ok_or_else(|| Error::State("Aiming not armed.".to_owned()))?;
        check_index(session, index)
    }

    /// Record the pose captured for one focus point.
    pub fn set_point(&self, user: &str, index: i64, pose: Pose) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(user)
            .ok_or_else(|| Error::State("Aiming not armed.".to_owned()))?;
        check_index(session, index)?;
        session.poses[index as usize] = Some(pose);
        Ok(())
    }

    /// All indices filled?
    pub fn check_done(&self, user: &str) -> Result<()> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(user)
            .ok_or_else(|| Error::State("Aiming not armed.".to_owned()))?;
        if session.missing() > 0 {
            return Err(Error::State(format!(
                "{} focus point(s) not recorded yet.",
                session.missing()
            )));
        }
        Ok(())
    }

    /// Finish a complete session, removing it.
    pub fn take_done(&self, user: &str) -> Result<AimingSession> {
        self.check_done(user)?;
        Ok(self.sessions.lock().remove(user).expect("checked above"))
    }

    pub fn cancel(&self, user: &str) -> Result<AimingSession> {
        self.sessions
            .lock()
            .remove(user)
            .ok_or_else(|| Error::State("Aiming not armed.".to_owned()))
    }

    /// Drop sessions older than the given age; run on user login.
    pub fn prune_older_than(&self, age: Duration) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.started.elapsed() <= age);
        before - sessions.len()
    }
}

fn check_index(session: &AimingSession, index: i64) -> Result<()> {
    if index < 0 || index as usize >= session.poses.len() {
        return Err(Error::Validation(format!(
            "Focus point index {index} out of range 0..{}.",
            session.poses.len()
        )));
    }
    if session.poses[index as usize].is_some() {
        return Err(Error::Validation(format!(
            "Focus point {index} already recorded."
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn robot() -> RobotTarget {
        RobotTarget {
            robot_id: "rob".into(),
            end_effector: "eef1".into(),
            arm_id: Some("left".into()),
        }
    }

    #[test]
    fn armed_idle_transitions() {
        let table = AimingTable::new();
        table.start("u1", "obj", robot(), 2).unwrap();
        // Repeat start while armed is refused.
        assert!(table.start("u1", "obj2", robot(), 2).is_err());
        // Another user cannot target the same object.
        assert!(table.start("u2", "obj", robot(), 2).is_err());
        table.cancel("u1").unwrap();
        table.start("u1", "obj", robot(), 2).unwrap();
    }

    #[test]
    fn point_index_rules() {
        let table = AimingTable::new();
        table.start("u1", "obj", robot(), 2).unwrap();
        assert!(table.check_point("u1", -1).is_err());
        assert!(table.check_point("u1", 2).is_err());
        table.set_point("u1", 0, Pose::default()).unwrap();
        // Already recorded.
        assert!(table.set_point("u1", 0, Pose::default()).is_err());
        // Done needs all slots.
        assert!(table.check_done("u1").is_err());
        table.set_point("u1", 1, Pose::default()).unwrap();
        let session = table.take_done("u1").unwrap();
        assert_eq!(session.recorded().len(), 2);
        // Finishing disarms.
        assert!(table.check_done("u1").is_err());
    }

    #[test]
    fn prune_drops_stale_sessions() {
        let table = AimingTable::new();
        table.start("u1", "obj", robot(), 1).unwrap();
        assert_eq!(table.prune_older_than(Duration::from_secs(60)), 0);
        assert_eq!(table.prune_older_than(Duration::ZERO), 1);
        assert!(table.get("u1").is_err());
    }
}
