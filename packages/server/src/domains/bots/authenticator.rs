use tracing::debug;

use super::credentials::{credential_matches, hash_credential};
use super::models::BotIdentity;
use super::registry::BotRegistry;
use crate::common::{AuthenticationError, CoordinatorError};

/// Decide whether `credential` authenticates the looked-up bot.
///
/// Unknown, disabled and wrong-credential bots all produce the same error.
/// The credential is hashed and compared even when the bot is missing so the
/// three cases take comparable time.
pub fn verify_bot(bot: Option<BotIdentity>, credential: &str) -> Result<BotIdentity, AuthenticationError> {
    match bot {
        Some(bot) => {
            let matches = credential_matches(&bot.credential_hash, credential);
            if matches && bot.enabled {
                Ok(bot)
            } else {
                Err(AuthenticationError)
            }
        }
        None => {
            let _ = credential_matches(&hash_credential(""), credential);
            Err(AuthenticationError)
        }
    }
}

/// Look the bot up and verify its credential.
pub async fn authenticate(
    registry: &dyn BotRegistry,
    bot_id: &str,
    credential: &str,
) -> Result<BotIdentity, CoordinatorError> {
    let bot = registry.find_bot(bot_id).await?;
    verify_bot(bot, credential).map_err(|e| {
        debug!(bot_id, "bot authentication rejected");
        e.into()
    })
}
