use serde::{Deserialize, Serialize};

use super::repo::User;

/// Request body for registration. Age is optional and defaults to 0,
/// matching the column default.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    pub age: Option<i32>,
}

/// Request body for login.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Whitelisted PATCH fields. Built from an already key-validated JSON map.
#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub age: Option<i32>,
}

/// Response returned after registration and login.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub user: User,
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;
    use uuid::Uuid;

    #[test]
    fn auth_response_serialization() {
        let response = AuthResponse {
            user: User {
                id: Uuid::new_v4(),
                name: "Ada".into(),
                email: "ada@example.com".into(),
                password_hash: "hash".into(),
                age: 0,
                avatar: None,
                tokens: vec!["tok".into()],
                created_at: OffsetDateTime::now_utc(),
            },
            token: "session-token".into(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"token\":\"session-token\""));
        assert!(json.contains("ada@example.com"));
        assert!(!json.contains("password_hash"));
    }

    #[test]
    fn update_request_from_partial_map() {
        let body: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(r#"{"age": 31}"#).unwrap();
        let req: UpdateUserRequest =
            serde_json::from_value(serde_json::Value::Object(body)).unwrap();
        assert_eq!(req.age, Some(31));
        assert!(req.name.is_none());
        assert!(req.email.is_none());
        assert!(req.password.is_none());
    }
}
