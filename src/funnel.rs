//! Funnel state machine and guard-rail dispatcher.
//!
//! Every inbound text runs through a fixed-priority decision table before
//! the AI ever sees it: replies to an open menu, handoff offer or name
//! request are answered deterministically; only unmatched messages reach
//! the agent. The funnel position is first-class state (one row per
//! participant) rather than something re-inferred from the message log.

use std::sync::Arc;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::gateway::OutboundGateway;
use crate::store::Store;
use crate::types::{
    env_i64, env_or, Direction, FunnelSnapshot, FunnelState, Kind, Participant,
};

/// Seam between the dispatcher and the AI Orchestrator. `None` means the
/// orchestrator could not produce anything, fallback included.
#[async_trait]
pub trait AgentBrain: Send + Sync {
    async fn reply(&self, participant: &Participant, text: &str) -> Option<String>;
}

#[derive(Clone)]
pub struct FunnelConfig {
    pub menu_window: Duration,
    pub action_dup_window: Duration,
    pub name_retry_cap: u32,
    pub bot_name: String,
    pub demo_video_url: String,
    pub handoff_notify_phone: String,
    pub menu_prompt: String,
    pub menu_choices: Vec<String>,
    pub video_caption: String,
    pub handoff_offer_text: String,
    pub name_request_text: String,
    pub closing_text: String,
    pub deferred_text: String,
    pub media_ack_text: String,
    pub ai_apology_text: String,
}

impl FunnelConfig {
    pub fn defaults() -> FunnelConfig {
        FunnelConfig {
            menu_window: Duration::seconds(1800),
            action_dup_window: Duration::seconds(120),
            name_retry_cap: 3,
            bot_name: "Luna".to_string(),
            demo_video_url: String::new(),
            handoff_notify_phone: String::new(),
            menu_prompt: "Quer conhecer nossos vídeos personalizados? 🎬".to_string(),
            menu_choices: vec!["Sim, quero ver!".to_string(), "Agora não".to_string()],
            video_caption: "Dá uma olhada no que a gente faz! 🎥".to_string(),
            handoff_offer_text:
                "Posso pedir para alguém do nosso time falar com você. Prefere agora ou mais tarde?"
                    .to_string(),
            name_request_text:
                "Pra te direcionar certinho, como você prefere ser chamado(a)?".to_string(),
            closing_text: "Sem problemas! Se mudar de ideia é só mandar um oi. 😉".to_string(),
            deferred_text: "Combinado! Vou pedir pro nosso time te chamar mais tarde. 🙌"
                .to_string(),
            media_ack_text: "Arquivo recebido com sucesso. Já estou processando! ✅".to_string(),
            ai_apology_text: "Desculpe, não consegui processar sua mensagem agora.".to_string(),
        }
    }

    pub fn from_env() -> FunnelConfig {
        let defaults = FunnelConfig::defaults();
        FunnelConfig {
            menu_window: Duration::seconds(env_i64("MENU_WINDOW_SECS", 1800)),
            action_dup_window: Duration::seconds(env_i64("ACTION_DUP_WINDOW_SECS", 120)),
            name_retry_cap: env_i64("NAME_RETRY_CAP", 3).max(1) as u32,
            bot_name: env_or("BOT_NAME", &defaults.bot_name),
            demo_video_url: env_or("DEMO_VIDEO_URL", ""),
            handoff_notify_phone: env_or("HANDOFF_NOTIFY_PHONE", ""),
            menu_prompt: env_or("FUNNEL_MENU_PROMPT", &defaults.menu_prompt),
            menu_choices: defaults.menu_choices.clone(),
            video_caption: env_or("FUNNEL_VIDEO_CAPTION", &defaults.video_caption),
            handoff_offer_text: env_or("FUNNEL_HANDOFF_OFFER", &defaults.handoff_offer_text),
            name_request_text: env_or("FUNNEL_NAME_REQUEST", &defaults.name_request_text),
            closing_text: env_or("FUNNEL_CLOSING", &defaults.closing_text),
            deferred_text: env_or("FUNNEL_DEFERRED_ACK", &defaults.deferred_text),
            media_ack_text: env_or("FUNNEL_MEDIA_ACK", &defaults.media_ack_text),
            ai_apology_text: env_or("FUNNEL_AI_APOLOGY", &defaults.ai_apology_text),
        }
    }

    pub fn handoff_confirm_text(&self, name: Option<&str>) -> String {
        match name {
            Some(name) => format!(
                "Perfeito, {name}! Já avisei nosso time, logo alguém fala com você. ✅"
            ),
            None => "Perfeito! Já avisei nosso time, logo alguém fala com você. ✅".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Intent classification
// ---------------------------------------------------------------------------

/// Accent-folded, punctuation-free lowercase text for vocabulary matching.
fn normalize_for_match(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' | 'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'a',
            'é' | 'ê' | 'è' | 'ë' | 'É' | 'Ê' | 'È' | 'Ë' => 'e',
            'í' | 'î' | 'ì' | 'ï' | 'Í' | 'Î' | 'Ì' | 'Ï' => 'i',
            'ó' | 'ô' | 'õ' | 'ò' | 'ö' | 'Ó' | 'Ô' | 'Õ' | 'Ò' | 'Ö' => 'o',
            'ú' | 'û' | 'ù' | 'ü' | 'Ú' | 'Û' | 'Ù' | 'Ü' => 'u',
            'ç' | 'Ç' => 'c',
            c if c.is_alphanumeric() => c.to_ascii_lowercase(),
            _ => ' ',
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuIntent {
    Affirmative,
    Negative,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffIntent {
    Now,
    Later,
    Other,
}

/// Replaceable vocabulary-based classifier. Single terms match on token
/// boundaries, phrases by substring; everything is matched on accent-folded
/// lowercase text. This is deliberately loose natural-language matching,
/// not a grammar.
#[derive(Clone)]
pub struct IntentLexicon {
    affirmative: Vec<String>,
    negative: Vec<String>,
    now: Vec<String>,
    later: Vec<String>,
}

impl Default for IntentLexicon {
    fn default() -> IntentLexicon {
        let list = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        IntentLexicon {
            affirmative: list(&[
                "sim", "quero", "pode", "claro", "bora", "vamos", "ok", "okay", "yes", "isso",
                "show", "top", "manda", "com certeza", "pode ser", "quero ver", "sim quero",
            ]),
            negative: list(&[
                "nao", "no", "nunca", "depois", "agora nao", "nao quero", "deixa", "dispenso",
                "para", "pare",
            ]),
            now: list(&["agora", "ja", "sim", "hoje", "now", "pode ser", "bora"]),
            later: list(&[
                "depois", "mais tarde", "later", "amanha", "outro dia", "agora nao", "semana que vem",
            ]),
        }
    }
}

impl IntentLexicon {
    fn matches(&self, vocabulary: &[String], text: &str) -> bool {
        let normalized = normalize_for_match(text);
        let tokens: Vec<&str> = normalized.split(' ').collect();
        vocabulary.iter().any(|term| {
            if term.contains(' ') {
                normalized.contains(term.as_str())
            } else {
                tokens.iter().any(|t| t == term)
            }
        })
    }

    /// Negative wins on overlap ("agora não" must never read as yes).
    pub fn menu_intent(&self, text: &str) -> MenuIntent {
        if self.matches(&self.negative, text) {
            MenuIntent::Negative
        } else if self.matches(&self.affirmative, text) {
            MenuIntent::Affirmative
        } else {
            MenuIntent::Other
        }
    }

    /// Later wins on overlap for the same reason.
    pub fn handoff_intent(&self, text: &str) -> HandoffIntent {
        if self.matches(&self.later, text) {
            HandoffIntent::Later
        } else if self.matches(&self.now, text) {
            HandoffIntent::Now
        } else {
            HandoffIntent::Other
        }
    }
}

// ---------------------------------------------------------------------------
// Name capture
// ---------------------------------------------------------------------------

const NAME_FILLER_WORDS: &[&str] = &[
    "oi", "ola", "bom", "boa", "dia", "tarde", "noite", "meu", "minha", "nome", "e", "eh", "sou",
    "o", "a", "aqui", "me", "chamo", "chamam", "pode", "chamar", "de", "pra", "para", "por",
    "favor", "tudo", "bem",
];

/// Treat free text as a candidate name: drop greetings and filler, cap at
/// two tokens, reject anything with digits or punctuation.
pub fn sanitize_name(raw: &str) -> Option<String> {
    let mut tokens: Vec<&str> = Vec::new();
    for token in raw.split_whitespace() {
        let cleaned = token.trim_matches(|c: char| !c.is_alphanumeric());
        if cleaned.is_empty() {
            continue;
        }
        if NAME_FILLER_WORDS.contains(&normalize_for_match(cleaned).as_str()) {
            continue;
        }
        if !cleaned.chars().all(|c| c.is_alphabetic() || c == '-') {
            continue;
        }
        tokens.push(cleaned);
        if tokens.len() == 2 {
            break;
        }
    }
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

// ---------------------------------------------------------------------------
// Directive stripping
// ---------------------------------------------------------------------------

fn directive_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(?:etapa|acao|ctx|sistema)\s*:[^\]]*\]").unwrap())
}

/// Remove machine-directive markup from an AI reply before it reaches the
/// human: `[etapa:..]`-style tags and a stray code-fence wrapper.
pub fn strip_directives(raw: &str) -> String {
    let mut text = raw.trim().to_string();
    if text.starts_with("```") {
        text = text
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string();
    }
    let text = directive_regex().replace_all(&text, "").to_string();
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Machine-readable hint describing the currently-open funnel step,
/// prefixed to the text forwarded to the agent.
fn context_hint(snapshot: &FunnelSnapshot, fresh: bool) -> Option<String> {
    if !fresh || snapshot.state == FunnelState::Idle {
        return None;
    }
    Some(format!("[etapa:{}]", snapshot.state.as_str()))
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Funnel {
    store: Arc<dyn Store>,
    gateway: Arc<dyn OutboundGateway>,
    brain: Arc<dyn AgentBrain>,
    cfg: FunnelConfig,
    intents: IntentLexicon,
}

impl Funnel {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn OutboundGateway>,
        brain: Arc<dyn AgentBrain>,
        cfg: FunnelConfig,
        intents: IntentLexicon,
    ) -> Funnel {
        Funnel {
            store,
            gateway,
            brain,
            cfg,
            intents,
        }
    }

    /// Guard-rail decision table, fixed priority, first match wins.
    pub async fn handle_text(&self, participant: &Participant, text: &str) -> Result<(), String> {
        let now = Utc::now();
        let mut snapshot = self.store.funnel_snapshot(&participant.id).await?;
        let fresh = snapshot.state_fresh(self.cfg.menu_window, now);

        match snapshot.state {
            FunnelState::MenuOffered if fresh => match self.intents.menu_intent(text) {
                MenuIntent::Affirmative => {
                    self.fire_video_then_handoff(participant, &mut snapshot).await;
                    return Ok(());
                }
                MenuIntent::Negative => {
                    self.deliver(participant, Kind::Text, &self.cfg.closing_text).await;
                    snapshot.enter(FunnelState::Idle, Utc::now());
                    self.save(&snapshot).await;
                    return Ok(());
                }
                MenuIntent::Other => {}
            },
            FunnelState::AwaitingName if fresh => {
                self.capture_name(participant, &mut snapshot, text).await;
                return Ok(());
            }
            FunnelState::HandoffOffered if fresh => match self.intents.handoff_intent(text) {
                HandoffIntent::Later => {
                    self.deliver(participant, Kind::Text, &self.cfg.deferred_text).await;
                    snapshot.enter(FunnelState::Idle, Utc::now());
                    self.save(&snapshot).await;
                    return Ok(());
                }
                HandoffIntent::Now => {
                    match participant.display_name.as_deref() {
                        Some(name) => {
                            self.fire_handoff(participant, Some(name)).await;
                            snapshot.enter(FunnelState::Idle, Utc::now());
                        }
                        None => {
                            self.deliver(participant, Kind::NameRequest, &self.cfg.name_request_text)
                                .await;
                            let at = Utc::now();
                            snapshot.enter(FunnelState::AwaitingName, at);
                            snapshot.mark_sent(Kind::NameRequest, at);
                        }
                    }
                    self.save(&snapshot).await;
                    return Ok(());
                }
                HandoffIntent::Other => {}
            },
            _ => {}
        }

        self.forward_to_brain(participant, &snapshot, fresh, text).await;
        Ok(())
    }

    /// Non-text inbound: acknowledge receipt, nothing else.
    pub async fn handle_media(&self, participant: &Participant, kind: Kind) -> Result<(), String> {
        debug!(phone = %participant.phone, kind = kind.as_str(), "media inbound, sending receipt ack");
        self.deliver(participant, Kind::Text, &self.cfg.media_ack_text).await;
        Ok(())
    }

    async fn fire_video_then_handoff(&self, participant: &Participant, snapshot: &mut FunnelSnapshot) {
        let now = Utc::now();
        if snapshot.was_recently_sent(Kind::Video, self.cfg.action_dup_window, now) {
            debug!(phone = %participant.phone, "demo video suppressed, sent recently");
        } else if self.cfg.demo_video_url.is_empty() {
            warn!("DEMO_VIDEO_URL not configured, skipping video step");
        } else {
            let sent = self
                .gateway
                .send_media(
                    &participant.phone,
                    &self.cfg.demo_video_url,
                    &self.cfg.video_caption,
                    Kind::Video,
                )
                .await;
            match sent {
                Ok(()) => {
                    let _ = self
                        .store
                        .append_event(
                            &participant.id,
                            Direction::Outbound,
                            Kind::Video,
                            Some(&self.cfg.video_caption),
                            Some(&self.cfg.demo_video_url),
                        )
                        .await;
                    snapshot.mark_sent(Kind::Video, now);
                    snapshot.enter(FunnelState::VideoSent, now);
                }
                Err(err) => warn!(phone = %participant.phone, "video delivery failed: {err}"),
            }
        }

        self.deliver(participant, Kind::HandoffOffer, &self.cfg.handoff_offer_text)
            .await;
        let at = Utc::now();
        snapshot.mark_sent(Kind::HandoffOffer, at);
        snapshot.enter(FunnelState::HandoffOffered, at);
        self.save(snapshot).await;
    }

    async fn capture_name(&self, participant: &Participant, snapshot: &mut FunnelSnapshot, text: &str) {
        match sanitize_name(text) {
            Some(name) => {
                if let Err(err) = self.store.set_display_name(&participant.id, &name).await {
                    warn!(phone = %participant.phone, "failed to persist name: {err}");
                }
                self.fire_handoff(participant, Some(&name)).await;
                snapshot.enter(FunnelState::Idle, Utc::now());
            }
            None => {
                snapshot.name_attempts += 1;
                if snapshot.name_attempts >= self.cfg.name_retry_cap {
                    // Bounded retries: give up on the name and hand off anyway.
                    self.fire_handoff(participant, None).await;
                    snapshot.enter(FunnelState::Idle, Utc::now());
                } else {
                    self.deliver(participant, Kind::NameRequest, &self.cfg.name_request_text)
                        .await;
                    let at = Utc::now();
                    snapshot.mark_sent(Kind::NameRequest, at);
                    snapshot.entered_at = at;
                }
            }
        }
        self.save(snapshot).await;
    }

    async fn fire_handoff(&self, participant: &Participant, name: Option<&str>) {
        if self.cfg.handoff_notify_phone.is_empty() {
            warn!("HANDOFF_NOTIFY_PHONE not configured, skipping operator notification");
        } else {
            let who = name.unwrap_or("sem nome");
            let notice = format!(
                "Novo lead aguardando contato: {} ({who})",
                participant.phone
            );
            if let Err(err) = self
                .gateway
                .send_text(&self.cfg.handoff_notify_phone, &notice)
                .await
            {
                warn!("operator notification failed: {err}");
            }
        }
        let confirm = self.cfg.handoff_confirm_text(name);
        self.deliver(participant, Kind::Text, &confirm).await;
    }

    async fn forward_to_brain(
        &self,
        participant: &Participant,
        snapshot: &FunnelSnapshot,
        fresh: bool,
        text: &str,
    ) {
        let prompt = match context_hint(snapshot, fresh) {
            Some(hint) => format!("{hint} {text}"),
            None => text.to_string(),
        };
        let reply = self
            .brain
            .reply(participant, &prompt)
            .await
            .map(|raw| strip_directives(&raw))
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| self.cfg.ai_apology_text.clone());
        self.deliver(participant, Kind::Text, &reply).await;
    }

    /// Best-effort delivery: failures are logged and swallowed; the event is
    /// appended only for messages that actually went out.
    async fn deliver(&self, participant: &Participant, kind: Kind, text: &str) {
        match self.gateway.send_text(&participant.phone, text).await {
            Ok(()) => {
                let _ = self
                    .store
                    .append_event(&participant.id, Direction::Outbound, kind, Some(text), None)
                    .await;
            }
            Err(err) => warn!(phone = %participant.phone, "outbound delivery failed: {err}"),
        }
    }

    async fn save(&self, snapshot: &FunnelSnapshot) {
        if let Err(err) = self.store.save_funnel_snapshot(snapshot).await {
            warn!("funnel state save failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::gateway::testing::{GatewayCall, RecordingGateway};
    use crate::store::testing::MemStore;

    struct ScriptedBrain {
        calls: AtomicUsize,
        prompts: Mutex<Vec<String>>,
        reply: Option<String>,
    }

    impl ScriptedBrain {
        fn replying(text: &str) -> ScriptedBrain {
            ScriptedBrain {
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
                reply: Some(text.to_string()),
            }
        }

        fn failing() -> ScriptedBrain {
            ScriptedBrain {
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
                reply: None,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AgentBrain for ScriptedBrain {
        async fn reply(&self, _participant: &Participant, text: &str) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(text.to_string());
            self.reply.clone()
        }
    }

    struct Fixture {
        store: Arc<MemStore>,
        gateway: Arc<RecordingGateway>,
        brain: Arc<ScriptedBrain>,
        funnel: Funnel,
        participant: Participant,
    }

    fn fixture_with(cfg: FunnelConfig, brain: ScriptedBrain) -> Fixture {
        let store = Arc::new(MemStore::new());
        let gateway = Arc::new(RecordingGateway::new());
        let brain = Arc::new(brain);
        let funnel = Funnel::new(
            store.clone(),
            gateway.clone(),
            brain.clone(),
            cfg,
            IntentLexicon::default(),
        );
        let participant = Participant {
            id: "p1".to_string(),
            phone: "5511999998888".to_string(),
            display_name: None,
            thread_id: None,
            created_at: crate::types::now_iso(),
        };
        Fixture {
            store,
            gateway,
            brain,
            funnel,
            participant,
        }
    }

    fn fixture() -> Fixture {
        let mut cfg = FunnelConfig::defaults();
        cfg.demo_video_url = "https://cdn.example/demo.mp4".to_string();
        cfg.handoff_notify_phone = "5511000000000".to_string();
        fixture_with(cfg, ScriptedBrain::replying("Olá!"))
    }

    async fn seed_state(fix: &Fixture, state: FunnelState, minutes_ago: i64) {
        let now = Utc::now();
        let mut snap = FunnelSnapshot::new(&fix.participant.id, now);
        snap.enter(state, now - Duration::minutes(minutes_ago));
        match state {
            FunnelState::MenuOffered => snap.mark_sent(Kind::Menu, now - Duration::minutes(minutes_ago)),
            FunnelState::HandoffOffered => {
                snap.mark_sent(Kind::HandoffOffer, now - Duration::minutes(minutes_ago))
            }
            FunnelState::AwaitingName => {
                snap.mark_sent(Kind::NameRequest, now - Duration::minutes(minutes_ago))
            }
            _ => {}
        }
        fix.store.save_funnel_snapshot(&snap).await.unwrap();
    }

    #[tokio::test]
    async fn menu_affirmative_fires_video_and_handoff_without_ai() {
        let fix = fixture();
        seed_state(&fix, FunnelState::MenuOffered, 5).await;

        fix.funnel.handle_text(&fix.participant, "sim, quero!").await.unwrap();

        assert_eq!(fix.brain.call_count(), 0);
        let calls = fix.gateway.calls();
        assert!(matches!(calls[0], GatewayCall::Media { kind: Kind::Video, .. }));
        assert!(matches!(calls[1], GatewayCall::Text { .. }));

        let snap = fix.store.funnel_snapshot("p1").await.unwrap();
        assert_eq!(snap.state, FunnelState::HandoffOffered);
        assert!(fix.store.outbound_kinds().contains(&Kind::HandoffOffer));
    }

    #[tokio::test]
    async fn menu_negative_sends_closing_and_resets() {
        let fix = fixture();
        seed_state(&fix, FunnelState::MenuOffered, 5).await;

        fix.funnel.handle_text(&fix.participant, "agora não").await.unwrap();

        assert_eq!(fix.brain.call_count(), 0);
        assert_eq!(fix.gateway.texts(), vec![fix.funnel.cfg.closing_text.clone()]);
        let snap = fix.store.funnel_snapshot("p1").await.unwrap();
        assert_eq!(snap.state, FunnelState::Idle);
    }

    #[tokio::test]
    async fn stale_menu_falls_through_to_ai() {
        let fix = fixture();
        seed_state(&fix, FunnelState::MenuOffered, 45).await;

        fix.funnel.handle_text(&fix.participant, "sim").await.unwrap();

        assert_eq!(fix.brain.call_count(), 1);
        // Stale step: no context hint either.
        assert_eq!(fix.brain.prompts.lock().unwrap()[0], "sim");
    }

    #[tokio::test]
    async fn open_step_adds_context_hint_for_ai() {
        let fix = fixture();
        seed_state(&fix, FunnelState::MenuOffered, 5).await;

        fix.funnel
            .handle_text(&fix.participant, "quanto custa o serviço?")
            .await
            .unwrap();

        assert_eq!(fix.brain.call_count(), 1);
        assert_eq!(
            fix.brain.prompts.lock().unwrap()[0],
            "[etapa:menu_offered] quanto custa o serviço?"
        );
    }

    #[tokio::test]
    async fn awaiting_name_success_persists_and_notifies() {
        let fix = fixture();
        seed_state(&fix, FunnelState::AwaitingName, 2).await;

        fix.funnel
            .handle_text(&fix.participant, "meu nome é João Silva")
            .await
            .unwrap();

        let calls = fix.gateway.calls();
        assert!(calls.iter().any(|c| matches!(
            c,
            GatewayCall::Text { phone, text }
                if phone == "5511000000000" && text.contains("João Silva")
        )));
        let snap = fix.store.funnel_snapshot("p1").await.unwrap();
        assert_eq!(snap.state, FunnelState::Idle);
    }

    #[tokio::test]
    async fn unusable_name_asks_again_then_gives_up_at_cap() {
        let fix = fixture();
        seed_state(&fix, FunnelState::AwaitingName, 2).await;

        fix.funnel.handle_text(&fix.participant, "4545").await.unwrap();
        let snap = fix.store.funnel_snapshot("p1").await.unwrap();
        assert_eq!(snap.state, FunnelState::AwaitingName);
        assert_eq!(snap.name_attempts, 1);
        assert_eq!(fix.gateway.texts(), vec![fix.funnel.cfg.name_request_text.clone()]);

        fix.funnel.handle_text(&fix.participant, "9999").await.unwrap();
        fix.funnel.handle_text(&fix.participant, "8888").await.unwrap();

        // Third failure hits the cap: handoff proceeds without a name.
        let snap = fix.store.funnel_snapshot("p1").await.unwrap();
        assert_eq!(snap.state, FunnelState::Idle);
        let calls = fix.gateway.calls();
        assert!(calls.iter().any(|c| matches!(
            c,
            GatewayCall::Text { phone, text }
                if phone == "5511000000000" && text.contains("sem nome")
        )));
    }

    #[tokio::test]
    async fn handoff_now_without_name_asks_for_name() {
        let fix = fixture();
        seed_state(&fix, FunnelState::HandoffOffered, 2).await;

        fix.funnel.handle_text(&fix.participant, "agora").await.unwrap();

        assert_eq!(fix.brain.call_count(), 0);
        assert_eq!(fix.gateway.texts(), vec![fix.funnel.cfg.name_request_text.clone()]);
        let snap = fix.store.funnel_snapshot("p1").await.unwrap();
        assert_eq!(snap.state, FunnelState::AwaitingName);
        assert!(fix.store.outbound_kinds().contains(&Kind::NameRequest));
    }

    #[tokio::test]
    async fn handoff_now_with_name_on_file_fires_immediately() {
        let fix = fixture();
        seed_state(&fix, FunnelState::HandoffOffered, 2).await;
        let participant = Participant {
            display_name: Some("Ana".to_string()),
            ..fix.participant.clone()
        };

        fix.funnel.handle_text(&participant, "pode ser agora").await.unwrap();

        let calls = fix.gateway.calls();
        assert!(calls.iter().any(|c| matches!(
            c,
            GatewayCall::Text { phone, text } if phone == "5511000000000" && text.contains("Ana")
        )));
        let snap = fix.store.funnel_snapshot("p1").await.unwrap();
        assert_eq!(snap.state, FunnelState::Idle);
    }

    #[tokio::test]
    async fn handoff_later_sends_deferred_ack() {
        let fix = fixture();
        seed_state(&fix, FunnelState::HandoffOffered, 2).await;

        fix.funnel.handle_text(&fix.participant, "mais tarde").await.unwrap();

        assert_eq!(fix.brain.call_count(), 0);
        assert_eq!(fix.gateway.texts(), vec![fix.funnel.cfg.deferred_text.clone()]);
        let snap = fix.store.funnel_snapshot("p1").await.unwrap();
        assert_eq!(snap.state, FunnelState::Idle);
    }

    #[tokio::test]
    async fn idle_text_forwards_to_ai_verbatim() {
        let fix = fixture();

        fix.funnel.handle_text(&fix.participant, "oi").await.unwrap();

        assert_eq!(fix.brain.call_count(), 1);
        assert_eq!(fix.brain.prompts.lock().unwrap()[0], "oi");
        assert_eq!(fix.gateway.texts(), vec!["Olá!".to_string()]);
        assert_eq!(fix.store.outbound_kinds(), vec![Kind::Text]);
    }

    #[tokio::test]
    async fn ai_reply_directives_are_stripped() {
        let mut cfg = FunnelConfig::defaults();
        cfg.handoff_notify_phone = "5511000000000".to_string();
        let fix = fixture_with(cfg, ScriptedBrain::replying("[etapa:menu_offered] Olá! Tudo bem?"));

        fix.funnel.handle_text(&fix.participant, "oi").await.unwrap();

        assert_eq!(fix.gateway.texts(), vec!["Olá! Tudo bem?".to_string()]);
    }

    #[tokio::test]
    async fn ai_failure_sends_apology() {
        let cfg = FunnelConfig::defaults();
        let apology = cfg.ai_apology_text.clone();
        let fix = fixture_with(cfg, ScriptedBrain::failing());

        fix.funnel.handle_text(&fix.participant, "oi").await.unwrap();

        assert_eq!(fix.gateway.texts(), vec![apology]);
    }

    #[tokio::test]
    async fn delivery_failure_is_swallowed_and_not_logged_as_sent() {
        let store = Arc::new(MemStore::new());
        let gateway = Arc::new(RecordingGateway::failing());
        let brain = Arc::new(ScriptedBrain::replying("Olá!"));
        let funnel = Funnel::new(
            store.clone(),
            gateway,
            brain,
            FunnelConfig::defaults(),
            IntentLexicon::default(),
        );
        let participant = Participant {
            id: "p1".to_string(),
            phone: "5511999998888".to_string(),
            display_name: None,
            thread_id: None,
            created_at: crate::types::now_iso(),
        };

        funnel.handle_text(&participant, "oi").await.unwrap();

        // Failed sends never become outbound history.
        assert!(store.outbound_kinds().is_empty());
    }

    #[tokio::test]
    async fn media_inbound_gets_receipt_ack() {
        let fix = fixture();
        fix.funnel.handle_media(&fix.participant, Kind::Image).await.unwrap();
        assert_eq!(fix.gateway.texts(), vec![fix.funnel.cfg.media_ack_text.clone()]);
    }

    #[test]
    fn sanitize_name_cases() {
        assert_eq!(sanitize_name("meu nome é João Silva").as_deref(), Some("João Silva"));
        assert_eq!(sanitize_name("oi, sou a Maria").as_deref(), Some("Maria"));
        assert_eq!(sanitize_name("Pedro Henrique de Souza").as_deref(), Some("Pedro Henrique"));
        assert_eq!(sanitize_name("4545"), None);
        assert_eq!(sanitize_name("me chamo João123"), None);
        assert_eq!(sanitize_name(""), None);
        assert_eq!(sanitize_name("bom dia!"), None);
    }

    #[test]
    fn intent_lexicon_cases() {
        let lex = IntentLexicon::default();
        assert_eq!(lex.menu_intent("Sim, quero ver!"), MenuIntent::Affirmative);
        assert_eq!(lex.menu_intent("pode mandar"), MenuIntent::Affirmative);
        assert_eq!(lex.menu_intent("agora não"), MenuIntent::Negative);
        assert_eq!(lex.menu_intent("NÃO"), MenuIntent::Negative);
        assert_eq!(lex.menu_intent("quanto custa?"), MenuIntent::Other);
        // "no" must not match inside Portuguese words.
        assert_eq!(lex.menu_intent("nosso contrato venceu"), MenuIntent::Other);

        assert_eq!(lex.handoff_intent("agora"), HandoffIntent::Now);
        assert_eq!(lex.handoff_intent("pode ser já"), HandoffIntent::Now);
        assert_eq!(lex.handoff_intent("mais tarde"), HandoffIntent::Later);
        assert_eq!(lex.handoff_intent("agora não"), HandoffIntent::Later);
        assert_eq!(lex.handoff_intent("hmm"), HandoffIntent::Other);
    }

    #[test]
    fn strip_directives_cases() {
        assert_eq!(strip_directives("[etapa:menu_offered] Olá!"), "Olá!");
        assert_eq!(strip_directives("```json\nOlá!\n```"), "Olá!");
        assert_eq!(strip_directives("Olá [ctx: x] mundo"), "Olá mundo");
        assert_eq!(strip_directives("  Olá!  "), "Olá!");
    }
}
