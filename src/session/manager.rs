//! Call Session Manager - Lifecycle-Orchestrierung eines Anrufs
//!
//! Eine explizite Manager-Instanz pro Client: besitzt höchstens eine aktive
//! Call-Session und koordiniert Media, Transport und Signaling-Kanal für
//! deren Lebensdauer. Alle Status-Übergänge laufen serialisiert über ein
//! einziges Mutex; jeder terminale Pfad mündet in dieselbe idempotente
//! Freigabe-Routine.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use webrtc::track::track_remote::TrackRemote;

use crate::media::{LocalMedia, MediaError, MediaGateway};
use crate::session::{CallKind, CallSession, CallStatus, NewCallSession};
use crate::signaling::{
    SessionDescription, SignalBus, SignalPayload, SignalingChannel, SignalingError, SignalingInbox,
};
use crate::storage::{CallLogRecord, CallStore, StoreError};
use crate::transport::{PeerTransport, TransportConfig, TransportError, TransportEvent};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Another call is already active")]
    AlreadyActive,

    #[error("No active call")]
    NoActiveCall,

    #[error("Call session not found: {0}")]
    NotFound(String),

    #[error("Call session already terminal: {0}")]
    AlreadyTerminal(String),

    #[error("Local participant is not the receiver of this call")]
    NotReceiver,

    #[error("No offer relayed for this call yet")]
    MissingOffer,

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

// ============================================================================
// MANAGER EVENTS
// ============================================================================

/// Events des Managers, konsumierbar über `subscribe()`
#[derive(Clone)]
pub enum CallManagerEvent {
    /// Eingehender Anruf wurde registriert (Session klingelt)
    IncomingCall { session: CallSession },

    /// Session-Status hat sich geändert
    StateChanged {
        session_id: String,
        status: CallStatus,
    },

    /// Negotiation abgeschlossen - der Transport steht
    TransportConnected { session_id: String },

    /// Remote-Medien angekommen
    RemoteMedia {
        session_id: String,
        kind: &'static str,
        track: Arc<TrackRemote>,
    },
}

impl std::fmt::Debug for CallManagerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallManagerEvent::IncomingCall { session } => f
                .debug_struct("IncomingCall")
                .field("session_id", &session.id)
                .finish(),
            CallManagerEvent::StateChanged { session_id, status } => f
                .debug_struct("StateChanged")
                .field("session_id", session_id)
                .field("status", status)
                .finish(),
            CallManagerEvent::TransportConnected { session_id } => f
                .debug_struct("TransportConnected")
                .field("session_id", session_id)
                .finish(),
            CallManagerEvent::RemoteMedia {
                session_id, kind, ..
            } => f
                .debug_struct("RemoteMedia")
                .field("session_id", session_id)
                .field("kind", kind)
                .finish(),
        }
    }
}

// ============================================================================
// ACTIVE CALL
// ============================================================================

/// Die Ressourcen der gerade aktiven Session
struct ActiveCall {
    session: CallSession,
    media: Option<LocalMedia>,
    transport: Option<Arc<PeerTransport>>,
    channel: Option<Arc<SignalingChannel>>,
    driver: Option<JoinHandle<()>>,
}

impl ActiveCall {
    fn new(session: CallSession) -> Self {
        Self {
            session,
            media: None,
            transport: None,
            channel: None,
            driver: None,
        }
    }

    /// Die eine Freigabe-Routine: idempotent, bedingungslos auf jedem
    /// terminalen Pfad. Der Driver-Abbruch kommt zuletzt, damit sich die
    /// Routine auch aus dem Driver-Task selbst aufrufen lässt.
    async fn release(&mut self) {
        if let Some(mut media) = self.media.take() {
            media.release();
        }
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

// ============================================================================
// CALL SESSION MANAGER
// ============================================================================

/// Orchestriert den Anruf-Lifecycle eines Clients
pub struct CallSessionManager {
    local_participant: String,
    store: Arc<CallStore>,
    bus: Arc<dyn SignalBus>,
    media_gateway: Arc<dyn MediaGateway>,
    transport_config: TransportConfig,
    active: Arc<Mutex<Option<ActiveCall>>>,
    event_tx: broadcast::Sender<CallManagerEvent>,
}

impl CallSessionManager {
    pub fn new(
        local_participant: impl Into<String>,
        store: Arc<CallStore>,
        bus: Arc<dyn SignalBus>,
        media_gateway: Arc<dyn MediaGateway>,
        transport_config: TransportConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            local_participant: local_participant.into(),
            store,
            bus,
            media_gateway,
            transport_config,
            active: Arc::new(Mutex::new(None)),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallManagerEvent> {
        self.event_tx.subscribe()
    }

    pub fn local_participant(&self) -> &str {
        &self.local_participant
    }

    /// Die aktuell gehaltene Session (falls vorhanden)
    pub async fn current_session(&self) -> Option<CallSession> {
        self.active.lock().await.as_ref().map(|c| c.session.clone())
    }

    // ========================================================================
    // LIFECYCLE OPERATIONS
    // ========================================================================

    /// Startet einen ausgehenden Anruf
    pub async fn initiate_call(
        &self,
        receiver_id: &str,
        conversation_id: &str,
        kind: CallKind,
    ) -> Result<CallSession, SessionError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(SessionError::AlreadyActive);
        }
        // Genau eine aktive Session pro Teilnehmer-Paar, Kontext egal
        if self
            .store
            .find_active_for_pair(&self.local_participant, receiver_id)?
            .is_some()
        {
            return Err(SessionError::AlreadyActive);
        }

        let session = self.store.create_session(NewCallSession {
            caller_id: self.local_participant.clone(),
            receiver_id: receiver_id.to_string(),
            conversation_id: conversation_id.to_string(),
            call_kind: kind,
        })?;

        tracing::info!(
            "Initiating {} call {} to {}",
            kind.as_str(),
            session.id,
            receiver_id
        );
        self.emit_state(&session.id, CallStatus::Initiated);

        let mut call = ActiveCall::new(session.clone());
        match self.setup_caller(&mut call).await {
            Ok((inbox, transport_events)) => {
                call.driver = Some(self.spawn_driver(&call, inbox, transport_events));
                *active = Some(call);
                Ok(session)
            }
            Err(e) => {
                tracing::error!("Call setup failed: {}", e);
                call.release().await;
                self.finish_and_log(&session.id, CallStatus::Failed);
                Err(e)
            }
        }
    }

    /// Registriert einen eingehenden Anruf (die Session klingelt ab jetzt).
    /// Beschafft noch keine Ressourcen.
    pub async fn register_incoming(&self, session_id: &str) -> Result<CallSession, SessionError> {
        let active = self.active.lock().await;
        if active.is_some() {
            return Err(SessionError::AlreadyActive);
        }
        drop(active);

        let session = self.store.get_session(session_id)?;
        if session.is_terminal() {
            return Err(SessionError::AlreadyTerminal(session_id.to_string()));
        }
        if !session.is_receiver(&self.local_participant) {
            return Err(SessionError::NotReceiver);
        }

        let session = self.store.mark_ringing(session_id)?;
        tracing::info!(
            "Incoming {} call {} from {}",
            session.call_kind.as_str(),
            session.id,
            session.caller_id
        );

        let _ = self.event_tx.send(CallManagerEvent::IncomingCall {
            session: session.clone(),
        });
        self.emit_state(&session.id, session.status);
        Ok(session)
    }

    /// Nimmt einen eingehenden Anruf an
    pub async fn answer_call(&self, session_id: &str) -> Result<CallSession, SessionError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(SessionError::AlreadyActive);
        }

        let session = self.store.get_session(session_id)?;
        if session.is_terminal() {
            return Err(SessionError::AlreadyTerminal(session_id.to_string()));
        }
        if !session.is_receiver(&self.local_participant) {
            return Err(SessionError::NotReceiver);
        }

        let mut call = ActiveCall::new(session.clone());
        match self.setup_receiver(&mut call).await {
            Ok((inbox, transport_events)) => {
                let answered = call.session.clone();
                call.driver = Some(self.spawn_driver(&call, inbox, transport_events));
                *active = Some(call);

                self.emit_state(&answered.id, answered.status);
                Ok(answered)
            }
            Err(e) => {
                tracing::error!("Answering call {} failed: {}", session_id, e);
                // Gegenseite freigeben, bevor die Ressourcen fallen
                if let Some(channel) = &call.channel {
                    if let Err(send_err) = channel.send(SignalPayload::Hangup).await {
                        tracing::warn!("Failed to relay hangup: {}", send_err);
                    }
                }
                call.release().await;
                self.finish_and_log(session_id, CallStatus::Failed);
                Err(e)
            }
        }
    }

    /// Lehnt einen Anruf ab - beschafft weder Media noch Transport
    pub async fn reject_call(&self, session_id: &str) -> Result<CallSession, SessionError> {
        self.decline(session_id, CallStatus::Rejected).await
    }

    /// Markiert einen nie angenommenen Anruf als verpasst. Die Timeout-
    /// Policy dafür liegt beim Aufrufer - dieser Core kennt keine Timeouts.
    pub async fn mark_missed(&self, session_id: &str) -> Result<CallSession, SessionError> {
        self.decline(session_id, CallStatus::Missed).await
    }

    /// Beendet die aktive Session
    pub async fn end_call(&self) -> Result<CallSession, SessionError> {
        let mut active = self.active.lock().await;
        let call = active.as_mut().ok_or(SessionError::NoActiveCall)?;
        let session_id = call.session.id.clone();

        let current = self.store.get_session(&session_id)?;
        if current.is_terminal() {
            // Die Gegenseite war schneller - nur noch Ressourcen freigeben
            if let Some(mut call) = active.take() {
                call.release().await;
            }
            return Ok(current);
        }

        // Hangup raus, solange die Session im Store noch lebt
        if let Some(channel) = &call.channel {
            if let Err(e) = channel.send(SignalPayload::Hangup).await {
                tracing::warn!("Failed to relay hangup: {}", e);
            }
        }

        let finished = self
            .store
            .finish_session(&session_id, CallStatus::Ended, Utc::now())?;
        let _ = self.store.append_log(&CallLogRecord::from_session(&finished));

        if let Some(mut call) = active.take() {
            call.release().await;
        }

        tracing::info!(
            "Call {} ended, duration {:?}s",
            session_id,
            finished.duration_seconds
        );
        self.emit_state(&session_id, finished.status);
        Ok(finished)
    }

    // ========================================================================
    // MEDIA CONTROLS
    // ========================================================================

    /// Schaltet das Mikrofon um; `None` ohne aktive Medien
    pub async fn toggle_audio(&self) -> Option<bool> {
        let active = self.active.lock().await;
        active
            .as_ref()
            .and_then(|c| c.media.as_ref())
            .map(|m| m.toggle_audio())
    }

    /// Schaltet die Kamera um; `None` ohne aktive Medien
    pub async fn toggle_video(&self) -> Option<bool> {
        let active = self.active.lock().await;
        active
            .as_ref()
            .and_then(|c| c.media.as_ref())
            .map(|m| m.toggle_video())
    }

    /// Mikrofon-Pegel der aktiven Session (für UI)
    pub async fn input_level(&self) -> Option<f32> {
        let active = self.active.lock().await;
        active
            .as_ref()
            .and_then(|c| c.media.as_ref())
            .map(|m| m.input_level())
    }

    // ========================================================================
    // SETUP
    // ========================================================================

    /// Anrufer-Seite: Media → Transport (Initiator) → Offer über den Kanal
    async fn setup_caller(
        &self,
        call: &mut ActiveCall,
    ) -> Result<(SignalingInbox, mpsc::UnboundedReceiver<TransportEvent>), SessionError> {
        let session = call.session.clone();

        let media = self
            .media_gateway
            .acquire(session.call_kind.includes_video())?;
        let tracks = media.tracks();
        call.media = Some(media);

        let (channel, inbox) = SignalingChannel::open(
            Arc::clone(&self.bus),
            Arc::clone(&self.store),
            &session.id,
            &self.local_participant,
            session.other_participant(&self.local_participant),
        )
        .await?;
        let channel = Arc::new(channel);
        call.channel = Some(Arc::clone(&channel));

        let (transport_tx, transport_events) = mpsc::unbounded_channel();
        let transport = Arc::new(
            PeerTransport::open(self.transport_config.clone(), tracks, transport_tx).await?,
        );
        call.transport = Some(Arc::clone(&transport));

        // Alle Tracks hängen - jetzt darf das Offer raus
        let offer_sdp = transport.create_offer().await?;
        channel
            .send(SignalPayload::Offer(SessionDescription { sdp: offer_sdp }))
            .await?;

        Ok((inbox, transport_events))
    }

    /// Empfänger-Seite: Kanal zuerst (Backlog liefert das Offer), dann
    /// Media → Transport → Answer. `answered` wird erst gesetzt, wenn
    /// alles davon steht.
    async fn setup_receiver(
        &self,
        call: &mut ActiveCall,
    ) -> Result<(SignalingInbox, mpsc::UnboundedReceiver<TransportEvent>), SessionError> {
        let session = call.session.clone();

        let (channel, mut inbox) = SignalingChannel::open(
            Arc::clone(&self.bus),
            Arc::clone(&self.store),
            &session.id,
            &self.local_participant,
            session.other_participant(&self.local_participant),
        )
        .await?;
        let channel = Arc::new(channel);
        call.channel = Some(Arc::clone(&channel));

        let media = self
            .media_gateway
            .acquire(session.call_kind.includes_video())?;
        let tracks = media.tracks();
        call.media = Some(media);

        // Das Offer steckt im Backlog; Kandidaten davor werden mitgenommen
        let (offer, early_candidates) = wait_for_offer(&mut inbox).await?;

        let (transport_tx, transport_events) = mpsc::unbounded_channel();
        let transport = Arc::new(
            PeerTransport::open(self.transport_config.clone(), tracks, transport_tx).await?,
        );
        call.transport = Some(Arc::clone(&transport));

        let answer_sdp = transport.accept_offer(&offer.sdp).await?;
        for candidate in early_candidates {
            if let Err(e) = transport.add_remote_candidate(candidate).await {
                tracing::warn!("Failed to apply early ICE candidate: {}", e);
            }
        }

        let answered = self.store.mark_answered(&session.id, Utc::now())?;
        channel
            .send(SignalPayload::Answer(SessionDescription { sdp: answer_sdp }))
            .await?;

        call.session = answered;
        Ok((inbox, transport_events))
    }

    // ========================================================================
    // DECLINE (reject / missed)
    // ========================================================================

    async fn decline(
        &self,
        session_id: &str,
        status: CallStatus,
    ) -> Result<CallSession, SessionError> {
        let mut active = self.active.lock().await;

        let current = self.store.get_session(session_id)?;
        if current.is_terminal() {
            // Zweiter Schreiber: kein Fehler, kein zweiter Log-Eintrag
            return Ok(current);
        }

        let owned = matches!(&*active, Some(call) if call.session.id == session_id);

        // Hangup vor dem terminalen Übergang - danach nimmt der Store
        // keine Signale mehr an
        if owned {
            if let Some(channel) = active.as_ref().and_then(|c| c.channel.as_ref()) {
                if let Err(e) = channel.send(SignalPayload::Hangup).await {
                    tracing::warn!("Failed to relay hangup: {}", e);
                }
            }
        } else {
            self.send_detached_hangup(&current).await;
        }

        let finished = self.store.finish_session(session_id, status, Utc::now())?;
        let _ = self.store.append_log(&CallLogRecord::from_session(&finished));

        if owned {
            if let Some(mut call) = active.take() {
                call.release().await;
            }
        }

        tracing::info!("Call {} declined as {}", session_id, status.as_str());
        self.emit_state(session_id, finished.status);
        Ok(finished)
    }

    /// Hangup für eine Session, deren Kanal wir (noch) nicht halten -
    /// Ablehnen beschafft keinerlei Ressourcen
    async fn send_detached_hangup(&self, session: &CallSession) {
        match SignalingChannel::open(
            Arc::clone(&self.bus),
            Arc::clone(&self.store),
            &session.id,
            &self.local_participant,
            session.other_participant(&self.local_participant),
        )
        .await
        {
            Ok((channel, _inbox)) => {
                if let Err(e) = channel.send(SignalPayload::Hangup).await {
                    tracing::warn!("Failed to relay hangup: {}", e);
                }
                channel.close().await;
            }
            Err(e) => {
                tracing::warn!("Could not open channel for hangup: {}", e);
            }
        }
    }

    // ========================================================================
    // DRIVER
    // ========================================================================

    /// Event-Loop der aktiven Session: Inbox und Transport-Events.
    /// Lange Operationen laufen hier, nie im Zustellpfad des Busses.
    fn spawn_driver(
        &self,
        call: &ActiveCall,
        mut inbox: SignalingInbox,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let session_id = call.session.id.clone();
        let transport = call.transport.clone();
        let channel = call.channel.clone();
        let store = Arc::clone(&self.store);
        let active = Arc::clone(&self.active);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = inbox.recv() => {
                        let Some(msg) = msg else { break };
                        match msg.payload {
                            SignalPayload::Answer(sd) => {
                                let Some(transport) = &transport else { continue };
                                match transport.apply_answer(&sd.sdp).await {
                                    Ok(()) => {
                                        if let Ok(session) = store.get_session(&session_id) {
                                            let mut guard = active.lock().await;
                                            if let Some(call) = guard.as_mut() {
                                                call.session = session.clone();
                                            }
                                            drop(guard);
                                            let _ = event_tx.send(CallManagerEvent::StateChanged {
                                                session_id: session_id.clone(),
                                                status: session.status,
                                            });
                                        }
                                    }
                                    Err(e) => {
                                        tracing::error!("Failed to apply answer: {}", e);
                                        finish_active(&active, &store, &event_tx, &session_id, CallStatus::Failed).await;
                                        break;
                                    }
                                }
                            }
                            SignalPayload::Offer(_) => {
                                // Bereits beim Aufbau verarbeitet bzw. Duplikat
                            }
                            SignalPayload::IceCandidate(candidate) => {
                                let Some(transport) = &transport else { continue };
                                if let Err(e) = transport.add_remote_candidate(candidate).await {
                                    tracing::warn!("Failed to apply remote ICE candidate: {}", e);
                                }
                            }
                            SignalPayload::Hangup => {
                                tracing::info!("Remote hangup for call {}", session_id);
                                finish_active(&active, &store, &event_tx, &session_id, CallStatus::Ended).await;
                                break;
                            }
                        }
                    }

                    ev = transport_events.recv() => {
                        let Some(ev) = ev else { break };
                        match ev {
                            TransportEvent::StateChanged(state) => {
                                tracing::info!("Call {} transport state: {:?}", session_id, state);
                                if state == crate::transport::TransportState::Connected {
                                    let _ = event_tx.send(CallManagerEvent::TransportConnected {
                                        session_id: session_id.clone(),
                                    });
                                }
                                if state.is_fatal() {
                                    finish_active(&active, &store, &event_tx, &session_id, CallStatus::Failed).await;
                                    break;
                                }
                            }
                            TransportEvent::LocalCandidate(candidate) => {
                                // Nicht kritisch - Fehlschlag wird geschluckt
                                if let Some(channel) = &channel {
                                    if let Err(e) = channel
                                        .send(SignalPayload::IceCandidate(candidate))
                                        .await
                                    {
                                        tracing::warn!("Failed to relay ICE candidate: {}", e);
                                    }
                                }
                            }
                            TransportEvent::RemoteMedia { kind, track } => {
                                let _ = event_tx.send(CallManagerEvent::RemoteMedia {
                                    session_id: session_id.clone(),
                                    kind,
                                    track,
                                });
                            }
                        }
                    }
                }
            }
        })
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn emit_state(&self, session_id: &str, status: CallStatus) {
        let _ = self.event_tx.send(CallManagerEvent::StateChanged {
            session_id: session_id.to_string(),
            status,
        });
    }

    /// Terminaler Übergang ohne gehaltene Ressourcen (Setup-Fehlschlag)
    fn finish_and_log(&self, session_id: &str, status: CallStatus) {
        match self.store.finish_session(session_id, status, Utc::now()) {
            Ok(finished) => {
                let _ = self.store.append_log(&CallLogRecord::from_session(&finished));
                self.emit_state(session_id, finished.status);
            }
            Err(e) => {
                tracing::error!("Failed to finish session {}: {}", session_id, e);
            }
        }
    }
}

/// Terminaler Übergang aus dem Driver heraus: Store-Übergang (No-op, wenn
/// schon terminal), Log-Eintrag, Event, dann Ressourcen-Freigabe.
async fn finish_active(
    active: &Arc<Mutex<Option<ActiveCall>>>,
    store: &Arc<CallStore>,
    event_tx: &broadcast::Sender<CallManagerEvent>,
    session_id: &str,
    status: CallStatus,
) {
    let mut guard = active.lock().await;
    let owned = matches!(&*guard, Some(call) if call.session.id == session_id);
    if !owned {
        return;
    }

    let finished = match store.finish_session(session_id, status, Utc::now()) {
        Ok(finished) => finished,
        Err(e) => {
            tracing::error!("Failed to finish session {}: {}", session_id, e);
            let mut call = match guard.take() {
                Some(call) => call,
                None => return,
            };
            call.release().await;
            return;
        }
    };
    let _ = store.append_log(&CallLogRecord::from_session(&finished));

    let _ = event_tx.send(CallManagerEvent::StateChanged {
        session_id: session_id.to_string(),
        status: finished.status,
    });

    if let Some(mut call) = guard.take() {
        // release() bricht zuletzt den Driver ab - auch wenn dieser Code
        // gerade im Driver läuft, sind die Ressourcen dann schon frei
        call.release().await;
    }
}

/// Wartet auf das Offer in der Inbox; früh eintreffende Kandidaten werden
/// eingesammelt statt verworfen
async fn wait_for_offer(
    inbox: &mut SignalingInbox,
) -> Result<(SessionDescription, Vec<crate::signaling::IceCandidate>), SessionError> {
    let mut early_candidates = Vec::new();

    let deadline = tokio::time::Duration::from_secs(10);
    let result = tokio::time::timeout(deadline, async {
        loop {
            match inbox.recv().await {
                Some(msg) => match msg.payload {
                    SignalPayload::Offer(sd) => return Some(sd),
                    SignalPayload::IceCandidate(c) => early_candidates.push(c),
                    SignalPayload::Hangup => return None,
                    SignalPayload::Answer(_) => {}
                },
                None => return None,
            }
        }
    })
    .await;

    match result {
        Ok(Some(offer)) => Ok((offer, early_candidates)),
        _ => Err(SessionError::MissingOffer),
    }
}

// ============================================================================
// TESTS
// ============================================================================
