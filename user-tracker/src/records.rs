use crate::telemetry::MetricRecord;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

pub type DomainId = String;

pub const USER_TYPE_METRIC: &str = "tracker.users.type";

/// A user as returned inside an authentication domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct User {
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(rename = "type", deserialize_with = "null_as_default")]
    pub user_type: UserType,
    #[serde(deserialize_with = "null_as_default")]
    pub email: String,
    #[serde(deserialize_with = "null_as_default")]
    pub email_verification_state: String,
    #[serde(deserialize_with = "null_as_default")]
    pub last_active: String,
    #[serde(deserialize_with = "null_as_default")]
    pub time_zone: String
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserType {
    #[serde(deserialize_with = "null_as_default")]
    pub id: String
}

/// Reads an explicit JSON `null` as the type's default value.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One user tagged with the domain it was enumerated under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlatRecord {
    #[serde(rename = "authenticationDomainId")]
    pub auth_domain_id: DomainId,
    pub id: String,
    pub name: String,
    pub user_type: String,
    pub email: String,
    pub email_verification_state: String,
    pub last_active: String,
    pub time_zone: String
}

pub fn flatten(user: User, domain_id: &str) -> FlatRecord {
    FlatRecord {
        auth_domain_id: domain_id.to_string(),
        id: user.id,
        name: user.name,
        user_type: user.user_type.id,
        email: user.email,
        email_verification_state: user.email_verification_state,
        last_active: user.last_active,
        time_zone: user.time_zone
    }
}

impl FlatRecord {
    /// Numeric user type; codes that do not parse count as 0.
    pub fn user_type_value(&self) -> f64 {
        self.user_type.trim().parse::<f64>().unwrap_or(0.0)
    }

    pub fn to_user(&self) -> User {
        User {
            id: self.id.clone(),
            name: self.name.clone(),
            user_type: UserType {
                id: self.user_type.clone()
            },
            email: self.email.clone(),
            email_verification_state: self.email_verification_state.clone(),
            last_active: self.last_active.clone(),
            time_zone: self.time_zone.clone()
        }
    }

    pub fn to_metric(&self) -> MetricRecord {
        let attributes = BTreeMap::from([
            (
                "tracker.users.authDomainId".to_string(),
                self.auth_domain_id.clone()
            ),
            ("tracker.users.id".to_string(), self.id.clone()),
            ("tracker.users.name".to_string(), self.name.clone()),
            ("tracker.users.email".to_string(), self.email.clone()),
            (
                "tracker.users.emailVerificationState".to_string(),
                self.email_verification_state.clone()
            ),
            (
                "tracker.users.lastActive".to_string(),
                self.last_active.clone()
            ),
            ("tracker.users.timeZone".to_string(), self.time_zone.clone())
        ]);

        MetricRecord::gauge(USER_TYPE_METRIC, self.user_type_value()).with_attributes(attributes)
    }
}

/// Groups records back by domain, keeping first-seen domain order and the
/// record order within each domain.
pub fn regroup(records: &[FlatRecord]) -> Vec<(DomainId, Vec<User>)> {
    let mut groups: Vec<(DomainId, Vec<User>)> = Vec::new();

    for record in records {
        match groups
            .iter_mut()
            .find(|(domain, _)| *domain == record.auth_domain_id)
        {
            Some((_, users)) => users.push(record.to_user()),
            None => groups.push((record.auth_domain_id.clone(), vec![record.to_user()]))
        }
    }

    groups
}
