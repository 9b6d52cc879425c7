use rand::Rng;

/// The local participant as seen by the signaling service.
///
/// The address carries a fresh random suffix on every allocation, so a
/// reconnect never collides with a half-closed prior registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantIdentity {
    display_name: String,
    address: String,
}

impl ParticipantIdentity {
    pub fn allocate(display_name: &str) -> Self {
        let suffix = random_suffix();
        let address = format!("user-{}-{}", sanitize(display_name), suffix);
        ParticipantIdentity {
            display_name: display_name.to_string(),
            address,
        }
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

fn random_suffix() -> String {
    hex::encode(rand::rng().random::<[u8; 6]>())
}

// Addresses travel through the signaling service; keep them to one
// alphanumeric segment per participant.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if cleaned.is_empty() {
        "anon".to_string()
    } else {
        cleaned
    }
}
