//! Emoji used by the terminal front end, with plain-text fallbacks.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static PAUSE: Emoji<'_, '_> = Emoji("⏸️  ", "[||]");
pub static STOP: Emoji<'_, '_> = Emoji("⏹️  ", "[X]");

// Stage markers
pub static PEN: Emoji<'_, '_> = Emoji("📝 ", "[D]");
pub static SHIELD: Emoji<'_, '_> = Emoji("🛡️  ", "[S]");
pub static REVIEW: Emoji<'_, '_> = Emoji("🔍 ", "[Q]");
pub static ROUTE: Emoji<'_, '_> = Emoji("🔀 ", "[C]");
pub static PERSON: Emoji<'_, '_> = Emoji("🙋 ", "[H]");
