// author: kodeholic (powered by Claude)
// Session Identity Resolver: 세션 키 + 접속 identity → 권한 컨텍스트
//
// 예약(appointment) 레코드는 외부 협력자 소유. 여기서는 조회 trait 과
// 테스트/데모용 메모리 구현만 둔다.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use crate::core::SessionKey;
use crate::error::{CallError, CallResult};

/// 통화 당사자 구분: 정리 권한 정책의 기준
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Party {
    Clinician,
    Patient,
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Party::Clinician => write!(f, "clinician"),
            Party::Patient   => write!(f, "patient"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub room_id:      String,
    pub call_id:      String,
    pub clinician_id: String,
    pub patient_id:   String,
}

impl Appointment {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.room_id, &self.call_id)
    }
}

pub trait AppointmentDirectory: Send + Sync {
    fn appointment(&self, room_id: &str, call_id: &str) -> Option<Appointment>;
}

/// 메모리 예약부
#[derive(Default)]
pub struct StaticDirectory {
    appointments: Mutex<HashMap<SessionKey, Appointment>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, appointment: Appointment) {
        self.appointments.lock().unwrap().insert(appointment.key(), appointment);
    }

    pub fn remove(&self, key: &SessionKey) -> Option<Appointment> {
        self.appointments.lock().unwrap().remove(key)
    }
}

impl AppointmentDirectory for StaticDirectory {
    fn appointment(&self, room_id: &str, call_id: &str) -> Option<Appointment> {
        self.appointments
            .lock()
            .unwrap()
            .get(&SessionKey::new(room_id, call_id))
            .cloned()
    }
}

/// join_session 에 넘기는 권한 컨텍스트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub key:           SessionKey,
    pub identity:      String,
    pub party:         Party,
    pub peer_identity: String,
}

/// 미디어/시그널링 활동 전에 호출. 두 당사자 외에는 Authorization
pub fn resolve(
    directory: &dyn AppointmentDirectory,
    key:       &SessionKey,
    identity:  &str,
) -> CallResult<SessionContext> {
    let appointment = directory
        .appointment(&key.room_id, &key.call_id)
        .ok_or_else(|| CallError::Authorization(format!("no appointment for {}", key)))?;

    let (party, peer_identity) = if identity == appointment.clinician_id {
        (Party::Clinician, appointment.patient_id)
    } else if identity == appointment.patient_id {
        (Party::Patient, appointment.clinician_id)
    } else {
        return Err(CallError::Authorization(format!("{} is not a party of {}", identity, key)));
    };

    Ok(SessionContext {
        key: key.clone(),
        identity: identity.to_string(),
        party,
        peer_identity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> StaticDirectory {
        let dir = StaticDirectory::new();
        dir.insert(Appointment {
            room_id:      "H01".into(),
            call_id:      "APT1".into(),
            clinician_id: "dr_kim".into(),
            patient_id:   "pt_lee".into(),
        });
        dir
    }

    #[test]
    fn resolves_both_parties() {
        let dir = directory();
        let key = SessionKey::new("H01", "APT1");

        let doc = resolve(&dir, &key, "dr_kim").unwrap();
        assert_eq!(doc.party, Party::Clinician);
        assert_eq!(doc.peer_identity, "pt_lee");

        let pt = resolve(&dir, &key, "pt_lee").unwrap();
        assert_eq!(pt.party, Party::Patient);
        assert_eq!(pt.peer_identity, "dr_kim");
    }

    #[test]
    fn stranger_is_rejected() {
        let dir = directory();
        let err = resolve(&dir, &SessionKey::new("H01", "APT1"), "intruder").unwrap_err();
        assert!(matches!(err, CallError::Authorization(_)));
    }

    #[test]
    fn unknown_appointment_is_rejected() {
        let dir = directory();
        let err = resolve(&dir, &SessionKey::new("H01", "APT9"), "dr_kim").unwrap_err();
        assert!(matches!(err, CallError::Authorization(_)));
        dir.remove(&SessionKey::new("H01", "APT1"));
        assert!(resolve(&dir, &SessionKey::new("H01", "APT1"), "dr_kim").is_err());
    }
}
