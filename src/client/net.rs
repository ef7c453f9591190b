//! Per-connection worker tasks: outbound writer, inbound reader, dispatcher

use super::coordinator::{
    wait_stopped, Client, ClientInner, Outbound, SessionShared, StreamReader,
};
use super::router::Message;
use super::token::Outcome;
use crate::error::{ClientError, ClientResult};
use crate::packet::{Packet, QoS, SubAck};
use crate::store::{inbound_key, outbound_key};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace, warn};

/// Whether `packet` gets a message id and a durable record before it is written
fn needs_message_id(packet: &Packet) -> bool {
    match packet {
        Packet::Publish(publish) => publish.qos != QoS::AtMostOnce,
        Packet::Subscribe(_) | Packet::Unsubscribe(_) => true,
        _ => false,
    }
}

/// Drain the control queue ahead of the general queue until stopped
pub(crate) async fn run_writer(inner: Arc<ClientInner>, shared: Arc<SessionShared>) {
    let mut stop = shared.stop_signal();
    let mut control = inner.queues.control_rx.lock().await;
    let mut general = inner.queues.general_rx.lock().await;
    debug!(generation = shared.generation, "Writer started");

    loop {
        let item = tokio::select! {
            biased;
            _ = wait_stopped(&mut stop) => break,
            Some(item) = control.recv() => item,
            Some(item) = general.recv() => item,
        };
        if let Err(error) = send(&inner, &shared, &mut stop, item).await {
            inner.connection_lost(&shared, error);
            break;
        }
    }
    debug!(generation = shared.generation, "Writer stopped");
}

/// Write one queued packet
///
/// A write cut short by the stop signal returns `Ok`; teardown then fails the
/// token held in the session.
async fn send(
    inner: &ClientInner,
    shared: &SessionShared,
    stop: &mut watch::Receiver<bool>,
    item: Outbound,
) -> ClientResult<()> {
    let Outbound { mut packet, token } = item;

    let mut message_id = None;
    if let Some(token) = token.as_ref().filter(|_| needs_message_id(&packet)) {
        let Some(id) = inner.ids.allocate(token.clone()) else {
            warn!(packet = packet.name(), "No message id available");
            token.resolve_err(ClientError::MessageIdsExhausted);
            return Ok(());
        };
        packet.set_message_id(id);
        if let Err(e) = inner.store.put(&outbound_key(id), &packet) {
            error!(message_id = id, error = %e, "Failed to persist outbound packet");
            inner.ids.free(id);
            token.resolve_err(e.into());
            return Ok(());
        }
        message_id = Some(id);
    }

    // Acknowledged packets are tracked by id; the rest resolve once written
    if message_id.is_none() {
        if let Some(token) = &token {
            shared.hold(token.clone());
        }
    }

    let written = {
        let mut writer = shared.writer.lock().await;
        tokio::select! {
            biased;
            _ = wait_stopped(stop) => None,
            result = writer.write_packet(&packet) => Some(result),
        }
    };
    match written {
        Some(Ok(())) => {}
        Some(Err(e)) => {
            if let Some(token) = shared.release() {
                token.resolve_err(ClientError::connection_lost(format!("write failed: {e}")));
            }
            return Err(ClientError::connection_lost(format!("write failed: {e}")));
        }
        None => {
            debug!(packet = packet.name(), ?message_id, "Write interrupted by shutdown");
            return Ok(());
        }
    }
    inner.status.touch();
    trace!(packet = packet.name(), ?message_id, "Packet written");

    if let Some(token) = shared.release() {
        token.resolve_ok();
    }
    Ok(())
}

/// Read packets until stopped or the connection fails
pub(crate) async fn run_reader(
    inner: Arc<ClientInner>,
    shared: Arc<SessionShared>,
    mut reader: StreamReader,
    messages: mpsc::Sender<Message>,
) {
    let mut stop = shared.stop_signal();
    debug!(generation = shared.generation, "Reader started");

    loop {
        let packet = tokio::select! {
            biased;
            _ = wait_stopped(&mut stop) => break,
            result = reader.read_packet() => match result {
                Ok(packet) => packet,
                Err(e) => {
                    inner.connection_lost(
                        &shared,
                        ClientError::connection_lost(format!("read failed: {e}")),
                    );
                    break;
                }
            },
        };
        inner.status.touch();
        trace!(packet = packet.name(), "Packet received");

        if let Err(error) = handle_inbound(&inner, &shared, &messages, packet).await {
            inner.connection_lost(&shared, error);
            break;
        }
    }
    debug!(generation = shared.generation, "Reader stopped");
}

async fn handle_inbound(
    inner: &ClientInner,
    shared: &SessionShared,
    messages: &mpsc::Sender<Message>,
    packet: Packet,
) -> ClientResult<()> {
    match packet {
        Packet::Publish(publish) => {
            let id = publish.message_id;
            match publish.qos {
                QoS::AtMostOnce => deliver(messages, Message::from(publish)).await,
                QoS::AtLeastOnce => {
                    deliver(messages, Message::from(publish)).await;
                    queue_ack(inner, shared, Packet::PubAck { message_id: id }).await;
                }
                QoS::ExactlyOnce => {
                    let key = inbound_key(id);
                    // A redelivery of a message we already hold is only re-acknowledged
                    if inner.store.get(&key)?.is_none() {
                        inner.store.put(&key, &Packet::Publish(publish.clone()))?;
                        deliver(messages, Message::from(publish)).await;
                    } else {
                        debug!(message_id = id, "Duplicate QoS 2 publication suppressed");
                    }
                    queue_ack(inner, shared, Packet::PubRec { message_id: id }).await;
                }
            }
        }
        Packet::PubRel { message_id } => {
            inner.store.del(&inbound_key(message_id))?;
            queue_ack(inner, shared, Packet::PubComp { message_id }).await;
        }
        Packet::PubRec { message_id } => {
            let pubrel = Packet::PubRel { message_id };
            inner.store.put(&outbound_key(message_id), &pubrel)?;
            queue_ack(inner, shared, pubrel).await;
        }
        Packet::PubAck { message_id }
        | Packet::PubComp { message_id }
        | Packet::UnsubAck { message_id } => {
            complete(
                inner,
                message_id,
                Outcome {
                    message_id: Some(message_id),
                    ..Outcome::ok()
                },
            )?;
        }
        Packet::SubAck(suback) => {
            let outcome = suback_outcome(inner, &suback);
            complete(inner, suback.message_id, outcome)?;
        }
        Packet::PingResp => {
            shared.ping_outstanding.store(false, Ordering::SeqCst);
            trace!("PINGRESP received");
        }
        other => {
            warn!(packet = other.name(), "Ignoring unexpected packet from broker");
        }
    }
    Ok(())
}

fn suback_outcome(inner: &ClientInner, suback: &SubAck) -> Outcome {
    let error = suback
        .return_codes
        .iter()
        .position(|code| *code == 0x80)
        .map(|index| {
            let filter = inner
                .ids
                .lookup(suback.message_id)
                .and_then(|token| token.filters().get(index).cloned())
                .unwrap_or_default();
            ClientError::SubscriptionRejected { filter }
        });
    Outcome {
        error,
        granted_qos: suback.return_codes.clone(),
        message_id: Some(suback.message_id),
        ..Outcome::ok()
    }
}

/// Finish the operation owning `message_id`: drop its record, release the id
/// and resolve its token
fn complete(inner: &ClientInner, message_id: u16, outcome: Outcome) -> ClientResult<()> {
    inner.store.del(&outbound_key(message_id))?;
    let token = inner.ids.lookup(message_id);
    inner.ids.free(message_id);
    match token {
        Some(token) => {
            token.resolve(outcome);
        }
        None => debug!(message_id, "Acknowledgement for unknown message id"),
    }
    Ok(())
}

async fn deliver(messages: &mpsc::Sender<Message>, message: Message) {
    if messages.send(message).await.is_err() {
        debug!("Dispatcher gone, publication dropped");
    }
}

async fn queue_ack(inner: &ClientInner, shared: &SessionShared, packet: Packet) {
    let mut stop = shared.stop_signal();
    let outbound = Outbound {
        packet,
        token: None,
    };
    tokio::select! {
        biased;
        _ = wait_stopped(&mut stop) => {}
        result = inner.queues.control_tx.send(outbound) => {
            if result.is_err() {
                debug!("Control queue closed, acknowledgement dropped");
            }
        }
    }
}

/// Hand inbound publications to the router until stopped
pub(crate) async fn run_dispatcher(
    inner: Arc<ClientInner>,
    shared: Arc<SessionShared>,
    mut messages: mpsc::Receiver<Message>,
) {
    let mut stop = shared.stop_signal();
    let client = Client::from_inner(inner.clone());

    loop {
        tokio::select! {
            biased;
            _ = wait_stopped(&mut stop) => break,
            message = messages.recv() => match message {
                Some(message) => {
                    let handled = inner.router.dispatch(&client, &message);
                    trace!(topic = %message.topic, handlers = handled, "Publication dispatched");
                }
                None => break,
            },
        }
    }
}
