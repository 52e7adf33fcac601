//! The control procedure engine.
//!
//! This drives the LL control procedures of a single connection: it starts queued local
//! procedures, answers the peer's, resolves collisions between the two, and applies negotiated
//! updates at their instant. All of it is implemented on [`Connection`], which owns the state.
//!
//! Control PDUs leave through the connection's `ctrl_tx` queue and are handed to the data path
//! one per transmission. Two hooks report their fate back: `on_control_sent` when a PDU is first
//! transmitted and `on_control_acked` once the peer acknowledged it. The encryption handshakes
//! switch the cipher on and off at exactly these points.
//!
//! [`Connection`]: ../connection/struct.Connection.html

use {
    super::{
        channel_map::ChannelMap,
        connection::{
            instant_passed, ConnParams, Connection, EventCtx, InstantUpdate, TimingChange,
            VersionInfo, INSTANT_OFFSET, MAX_OCTETS, MAX_PACKET_TIME, MIN_PACKET_TIME,
        },
        data::{CteInfo, CteType, DataPdu, MIN_PAYLOAD},
        features::FeatureSet,
        llcp::{ConnParamRequest, ConnectionUpdateData, ControlOpcode, ControlPdu, LengthParams},
        procedure::{Disposition, Phase, Procedure, ProcedureKind, Responder},
        HostEvent, Role,
    },
    crate::{
        error::ErrorCode,
        phy::{Phy, PhySet},
        security::{rng::Trng, Key, MasterKeyMaterial, SlaveKeyMaterial},
        time::Duration,
        Error,
    },
    core::num::Wrapping,
};

/// Shortest and longest CTE a peer may request, in 8 µs units.
const CTE_LEN_RANGE: core::ops::RangeInclusive<u8> = 2..=20;

impl Connection {
    /// Queues a locally initiated procedure.
    pub(crate) fn request(&mut self, procedure: Procedure) -> Result<(), Error> {
        if self.is_terminating() {
            return Err(Error::InvalidState);
        }
        let kind = procedure.kind();
        // An update the peer started may still be waiting for its instant.
        if kind.uses_instant() && self.pending.is_some() {
            warn!("[{:?}] {:?} collides with pending instant", self.handle, kind);
            return Err(Error::ProcedureCollision);
        }
        self.procedures.enqueue(procedure).map_err(|e| {
            warn!("[{:?}] can't queue {:?}: {}", self.handle, kind, e);
            e
        })
    }

    /// Starts the next local procedure if none is active and checks the authenticated payload
    /// timeout. Called before every connection event.
    pub(super) fn run_procedures<T: Trng>(&mut self, ctx: &mut EventCtx<'_, T>) {
        if self.is_terminating() {
            return;
        }
        self.check_apto(ctx);

        // Starting a procedure may queue two PDUs (eg. the pause and the new request).
        if self.ctrl_tx.capacity() - self.ctrl_tx.len() < 2 {
            return;
        }
        // Only one update may wait for its instant at a time.
        if self.pending.is_some()
            && self
                .procedures
                .next_waiting()
                .map_or(false, |next| next.kind().uses_instant())
        {
            return;
        }
        let timeout = self.ctrl_timeout_events();
        let procedure = match self.procedures.activate_next(timeout) {
            Some(active) => active.procedure,
            None => return,
        };
        debug!("[{:?}] starting {:?}", self.handle, procedure);
        self.start_procedure(procedure, ctx);
    }

    fn start_procedure<T: Trng>(&mut self, procedure: Procedure, ctx: &mut EventCtx<'_, T>) {
        let phase = match procedure {
            Procedure::ConnectionUpdate {
                interval,
                latency,
                timeout,
            } => {
                let instant = self.send_connection_update(ConnParams {
                    interval,
                    latency,
                    timeout,
                });
                Phase::AwaitInstant(instant)
            }
            Procedure::ChannelMapUpdate(map) => {
                let instant = self.next_instant();
                self.pending = Some((instant, InstantUpdate::ChannelMap(map)));
                self.send_ctrl(ControlPdu::ChannelMapInd { map, instant });
                Phase::AwaitInstant(instant)
            }
            Procedure::Encryption { ltk, rand, ediv } => {
                self.data_paused = true;
                if self.enc.is_encrypted() {
                    self.send_ctrl(ControlPdu::PauseEncReq);
                    self.enc.set_ltk(ltk);
                    self.enc.set_master_material(MasterKeyMaterial {
                        rand,
                        ediv,
                        ..MasterKeyMaterial::default()
                    });
                    Phase::AwaitPauseEncRsp
                } else {
                    self.enc.set_ltk(ltk);
                    match self.send_enc_req(rand, ediv, ctx) {
                        Ok(()) => Phase::AwaitEncRsp,
                        Err(e) => {
                            warn!("[{:?}] no key material for ENC_REQ: {}", self.handle, e);
                            self.fail_active(ErrorCode::UnspecifiedError, ctx);
                            return;
                        }
                    }
                }
            }
            Procedure::FeatureExchange => {
                if let Some(features) = self.peer_features {
                    self.procedures.complete();
                    ctx.events.push(HostEvent::RemoteFeatures {
                        handle: self.handle,
                        status: ErrorCode::Success,
                        features,
                    });
                    return;
                }
                self.send_ctrl(match self.role {
                    Role::Master => ControlPdu::FeatureReq {
                        features_master: self.local_features,
                    },
                    Role::Slave => ControlPdu::SlaveFeatureReq {
                        features_slave: self.local_features,
                    },
                });
                Phase::AwaitResponse
            }
            Procedure::VersionExchange => {
                if let Some(version) = self.peer_version {
                    self.procedures.complete();
                    ctx.events.push(HostEvent::RemoteVersion {
                        handle: self.handle,
                        version,
                    });
                    return;
                }
                self.send_version();
                Phase::AwaitResponse
            }
            Procedure::Termination(reason) => {
                self.send_ctrl(ControlPdu::TerminateInd { error_code: reason });
                // The peer gets a supervision timeout's worth of events to acknowledge.
                let lsto = self.lsto_events();
                self.procedures.restart_timer(lsto);
                Phase::AwaitAck
            }
            Procedure::Ping => {
                self.send_ctrl(ControlPdu::PingReq);
                Phase::AwaitResponse
            }
            Procedure::DataLengthUpdate => {
                self.send_ctrl(ControlPdu::LengthReq(self.data_length.local));
                Phase::AwaitResponse
            }
            Procedure::PhyUpdate { tx_phys, rx_phys } => {
                self.phy.preferred_tx = tx_phys;
                self.phy.preferred_rx = rx_phys;
                self.send_ctrl(ControlPdu::PhyReq { tx_phys, rx_phys });
                Phase::AwaitResponse
            }
            Procedure::ConnParamRequest(req) => {
                self.send_ctrl(ControlPdu::ConnectionParamReq(req));
                Phase::AwaitResponse
            }
            Procedure::CteRequest {
                min_cte_len,
                cte_type,
            } => {
                self.send_ctrl(ControlPdu::CteReq {
                    min_cte_len,
                    cte_type,
                });
                Phase::AwaitResponse
            }
        };
        self.set_phase(phase);
    }

    fn set_phase(&mut self, phase: Phase) {
        if let Some(active) = self.procedures.active_mut() {
            active.phase = phase;
        }
    }

    /// Returns the phase of the active procedure if it is of kind `kind`.
    fn active_phase(&self, kind: ProcedureKind) -> Option<Phase> {
        self.procedures
            .active()
            .filter(|a| a.kind() == kind)
            .map(|a| a.phase)
    }

    fn send_ctrl(&mut self, pdu: ControlPdu) {
        if self.ctrl_tx.push_back(pdu).is_err() {
            error!("[{:?}] control TX queue full, dropping {:?}", self.handle, pdu);
        }
    }

    fn send_version(&mut self) {
        let v = self.local_version;
        self.send_ctrl(ControlPdu::VersionInd {
            vers_nr: v.vers_nr,
            company_id: v.company_id,
            sub_vers_nr: v.sub_vers_nr,
        });
        self.version_sent = true;
    }

    fn send_enc_req<T: Trng>(
        &mut self,
        rand: [u8; 8],
        ediv: u16,
        ctx: &mut EventCtx<'_, T>,
    ) -> Result<(), Error> {
        let skd_m = ctx.rng.key_bytes::<8>()?;
        let iv_m = ctx.rng.key_bytes::<4>()?;
        self.enc.set_master_material(MasterKeyMaterial {
            rand,
            ediv,
            skd_m,
            iv_m,
        });
        self.send_ctrl(ControlPdu::EncReq {
            rand,
            ediv,
            skd_m,
            iv_m,
        });
        Ok(())
    }

    /// Instant for an update queued during the current event.
    fn next_instant(&self) -> u16 {
        (self.event_counter + Wrapping(INSTANT_OFFSET) + Wrapping(self.params.latency)).0
    }

    /// Sends `LL_CONNECTION_UPDATE_IND` with `params` and records it as pending.
    fn send_connection_update(&mut self, params: ConnParams) -> u16 {
        let instant = self.next_instant();
        let data = ConnectionUpdateData {
            win_size: 1,
            win_offset: 0,
            interval: params.interval,
            latency: params.latency,
            timeout: params.timeout,
            instant,
        };
        self.pending = Some((instant, InstantUpdate::Connection(data)));
        self.send_ctrl(ControlPdu::ConnectionUpdateInd(data));
        instant
    }

    /// Sends a reject for the procedure the peer started with `opcode`.
    fn reject(&mut self, opcode: ControlOpcode, error_code: ErrorCode) {
        let ext_required = matches!(
            opcode,
            ControlOpcode::ConnectionParamReq | ControlOpcode::PhyReq | ControlOpcode::CteReq
        );
        let ext_supported = self.peer_features.map_or(false, |f| {
            f.contains(FeatureSet::EXTENDED_REJECT_INDICATION)
        });
        warn!(
            "[{:?}] rejecting {:?} with {:?}",
            self.handle, opcode, error_code
        );
        self.send_ctrl(if ext_required || ext_supported {
            ControlPdu::RejectExtInd {
                reject_opcode: opcode,
                error_code,
            }
        } else {
            ControlPdu::RejectInd { error_code }
        });
    }

    /// Counts a connection event against the procedure timers.
    pub(super) fn tick_procedures(&mut self) {
        if let Disposition::Terminate(reason) = self.procedures.tick() {
            match self.procedures.active().map(|a| a.procedure) {
                // The peer never acknowledged our LL_TERMINATE_IND.
                Some(Procedure::Termination(_)) => self.terminate(ErrorCode::LocalHostTerminated),
                _ => {
                    warn!("[{:?}] control procedure timed out", self.handle);
                    self.terminate(reason);
                }
            }
        }
    }

    /// Queues an `LL_PING_REQ` halfway through the authenticated payload timeout and reports its
    /// expiry.
    fn check_apto<T: Trng>(&mut self, ctx: &mut EventCtx<'_, T>) {
        if !self.enc.is_encrypted() || !self.features.contains(FeatureSet::LE_PING) {
            return;
        }
        let elapsed = u64::from((ctx.now - self.last_authenticated).as_micros());
        let apto = u64::from(self.apto.as_micros());
        if elapsed >= apto {
            warn!("[{:?}] authenticated payload timeout", self.handle);
            ctx.events
                .push(HostEvent::AuthenticatedPayloadTimeoutExpired {
                    handle: self.handle,
                });
            self.last_authenticated = ctx.now;
            self.apto_ping_queued = false;
        } else if elapsed * 2 >= apto && !self.apto_ping_queued {
            match self.procedures.enqueue(Procedure::Ping) {
                Ok(()) | Err(Error::ProcedureCollision) => self.apto_ping_queued = true,
                Err(_) => {}
            }
        }
    }

    /// Called when `pdu` is transmitted for the first time.
    pub(super) fn on_control_sent<T: Trng>(&mut self, pdu: ControlPdu, ctx: &mut EventCtx<'_, T>) {
        match (self.role, pdu) {
            // Everything the master sends from now on is encrypted.
            (Role::Slave, ControlPdu::StartEncReq) => {
                if let Err(e) = self.enc.enable_rx() {
                    self.terminate(super::connection::crypto_reason(e));
                }
            }
            // The master's answer comes unencrypted.
            (Role::Slave, ControlPdu::PauseEncRsp) => self.enc.disable_rx(),
            // The host had no key for the master's encryption request.
            (Role::Slave, ControlPdu::RejectInd { error_code })
            | (
                Role::Slave,
                ControlPdu::RejectExtInd {
                    reject_opcode: ControlOpcode::EncReq,
                    error_code,
                },
            ) if error_code == ErrorCode::PinOrKeyMissing => self.terminate(error_code),
            // A PHY update that changes nothing completes once it is out.
            (
                _,
                ControlPdu::PhyUpdateInd {
                    m_to_s_phy,
                    s_to_m_phy,
                    ..
                },
            ) if m_to_s_phy.is_empty()
                && s_to_m_phy.is_empty()
                && self.active_phase(ProcedureKind::PhyUpdate) == Some(Phase::AwaitAck) =>
            {
                self.finish_phy_update(ErrorCode::Success, ctx)
            }
            _ => {}
        }
    }

    /// Called when the peer acknowledged `pdu`.
    pub(super) fn on_control_acked<T: Trng>(
        &mut self,
        pdu: ControlPdu,
        ctx: &mut EventCtx<'_, T>,
    ) {
        match pdu {
            ControlPdu::TerminateInd { .. } => {
                if self.procedures.active_kind() == Some(ProcedureKind::Termination) {
                    self.terminate(ErrorCode::LocalHostTerminated);
                }
            }
            ControlPdu::StartEncRsp
                if self.role == Role::Slave
                    && self.procedures.responder() == Some(Responder::AwaitStartEncRspAck) =>
            {
                self.procedures.clear_responder();
                self.finish_encryption(ErrorCode::Success, ctx);
            }
            _ => {}
        }
    }

    fn finish_encryption<T: Trng>(&mut self, status: ErrorCode, ctx: &mut EventCtx<'_, T>) {
        self.data_paused = false;
        let refresh = core::mem::replace(&mut self.refreshing, false);
        if status == ErrorCode::Success {
            self.last_authenticated = ctx.now;
            self.apto_ping_queued = false;
            info!("[{:?}] encrypted", self.handle);
        } else {
            self.enc.clear_session();
        }
        ctx.events.push(if refresh && status == ErrorCode::Success {
            HostEvent::EncryptionKeyRefresh {
                handle: self.handle,
                status,
            }
        } else {
            HostEvent::EncryptionChange {
                handle: self.handle,
                status,
                enabled: status == ErrorCode::Success,
            }
        });

        // A link never continues in the clear after a failed encryption start. A collision
        // only aborts the attempt, unless the link was encrypted before.
        let collision = matches!(
            status,
            ErrorCode::LlProcedureCollision | ErrorCode::DifferentTransactionCollision
        );
        if status != ErrorCode::Success && (refresh || !collision) {
            self.terminate(status);
        }
    }

    fn finish_phy_update<T: Trng>(&mut self, status: ErrorCode, ctx: &mut EventCtx<'_, T>) {
        self.procedures.complete();
        ctx.events.push(HostEvent::PhyUpdateComplete {
            handle: self.handle,
            status,
            tx: self.phy.tx,
            rx: self.phy.rx,
        });
    }

    /// Aborts the active procedure after the peer rejected it (or didn't understand it) and
    /// reports the outcome to the host.
    fn fail_active<T: Trng>(&mut self, status: ErrorCode, ctx: &mut EventCtx<'_, T>) {
        let procedure = match self.procedures.complete() {
            Some(p) => p,
            None => return,
        };
        debug!(
            "[{:?}] {:?} failed with {:?}",
            self.handle,
            procedure.kind(),
            status
        );
        let handle = self.handle;
        match procedure {
            Procedure::Encryption { .. } => self.finish_encryption(status, ctx),
            Procedure::ConnParamRequest(req)
                if self.role == Role::Master && status == ErrorCode::UnsupportedRemoteFeature =>
            {
                // The slave doesn't know the request procedure; update unilaterally.
                let fallback = Procedure::ConnectionUpdate {
                    interval: req.interval_min.max(ctx.min_interval).min(req.interval_max),
                    latency: req.latency,
                    timeout: req.timeout,
                };
                if self.procedures.enqueue(fallback).is_err() {
                    ctx.events.push(HostEvent::ConnectionUpdateComplete {
                        handle,
                        status,
                        params: self.params,
                    });
                }
            }
            Procedure::ConnParamRequest(_) | Procedure::ConnectionUpdate { .. } => {
                ctx.events.push(HostEvent::ConnectionUpdateComplete {
                    handle,
                    status,
                    params: self.params,
                })
            }
            Procedure::PhyUpdate { .. } => ctx.events.push(HostEvent::PhyUpdateComplete {
                handle,
                status,
                tx: self.phy.tx,
                rx: self.phy.rx,
            }),
            Procedure::FeatureExchange => ctx.events.push(HostEvent::RemoteFeatures {
                handle,
                status,
                features: FeatureSet::empty(),
            }),
            Procedure::CteRequest { .. } => {
                ctx.events.push(HostEvent::CteRequestFailed { handle, status })
            }
            Procedure::ChannelMapUpdate(_)
            | Procedure::VersionExchange
            | Procedure::Termination(_)
            | Procedure::Ping
            | Procedure::DataLengthUpdate => {}
        }
    }

    /// Checks a peer request against the active local procedure.
    ///
    /// Returns `true` if the request was rejected because of a collision.
    fn resolve_collision(&mut self, opcode: ControlOpcode) -> bool {
        let is_request = matches!(
            opcode,
            ControlOpcode::EncReq
                | ControlOpcode::PauseEncReq
                | ControlOpcode::FeatureReq
                | ControlOpcode::SlaveFeatureReq
                | ControlOpcode::PingReq
                | ControlOpcode::LengthReq
                | ControlOpcode::PhyReq
                | ControlOpcode::ConnectionParamReq
                | ControlOpcode::CteReq
        );
        let peer_kind = match ProcedureKind::initiated_by(opcode) {
            Some(kind) if is_request => kind,
            _ => return false,
        };
        if !peer_kind.uses_instant() && peer_kind != ProcedureKind::Encryption {
            return false;
        }
        let ours = match self.procedures.active_kind() {
            Some(ours) if ours.conflicts_with(peer_kind) => ours,
            // An update the peer asked for earlier may still be waiting for its instant.
            _ if peer_kind.uses_instant() && self.pending.is_some() => {
                self.reject(opcode, ErrorCode::DifferentTransactionCollision);
                return true;
            }
            _ => return false,
        };

        if ours != peer_kind {
            self.reject(opcode, ErrorCode::DifferentTransactionCollision);
            true
        } else if self.role == Role::Master {
            self.reject(opcode, ErrorCode::LlProcedureCollision);
            true
        } else {
            // The master's procedure wins. Ours is dropped and the master's answered instead.
            debug!("[{:?}] abandoning {:?} for master's", self.handle, ours);
            self.procedures.complete();
            false
        }
    }

    /// Returns whether a PDU with `opcode` may be sent by the peer, given our role.
    fn allowed_from_peer(&self, opcode: ControlOpcode) -> bool {
        use self::ControlOpcode::*;

        match self.role {
            // PDUs only a master sends.
            Role::Master => !matches!(
                opcode,
                ConnectionUpdateInd
                    | ChannelMapInd
                    | EncReq
                    | FeatureReq
                    | PauseEncReq
                    | PhyUpdateInd
            ),
            // PDUs only a slave sends.
            Role::Slave => !matches!(
                opcode,
                EncRsp
                    | StartEncReq
                    | SlaveFeatureReq
                    | ConnectionParamRsp
                    | PhyRsp
                    | MinUsedChannelsInd
            ),
        }
    }

    /// Processes a received LL control PDU.
    pub(super) fn handle_control_pdu<T: Trng>(&mut self, pdu: &DataPdu, ctx: &mut EventCtx<'_, T>) {
        let ctrl = match pdu.to_control() {
            Ok(ControlPdu::Unknown { opcode, .. }) => {
                debug!("[{:?}] unknown control opcode {:?}", self.handle, opcode);
                self.send_ctrl(ControlPdu::UnknownRsp {
                    unknown_type: opcode,
                });
                return;
            }
            Ok(ctrl) => ctrl,
            Err(e) => {
                match pdu.payload().first() {
                    Some(&opcode) => {
                        debug!("[{:?}] malformed control PDU: {}", self.handle, e);
                        self.send_ctrl(ControlPdu::UnknownRsp {
                            unknown_type: ControlOpcode::from(opcode),
                        });
                    }
                    None => warn!("[{:?}] empty control PDU", self.handle),
                }
                return;
            }
        };
        debug!("[{:?}] <-LLCP {:?}", self.handle, ctrl);

        let opcode = ctrl.opcode();
        if !self.allowed_from_peer(opcode) {
            self.send_ctrl(ControlPdu::UnknownRsp {
                unknown_type: opcode,
            });
            return;
        }
        if self.resolve_collision(opcode) {
            return;
        }

        match ctrl {
            ControlPdu::ConnectionUpdateInd(data) => {
                if self.schedule_instant(data.instant, InstantUpdate::Connection(data))
                    && self.active_phase(ProcedureKind::ConnParamRequest).is_some()
                {
                    self.set_phase(Phase::AwaitInstant(data.instant));
                }
            }
            ControlPdu::ChannelMapInd { map, instant } => {
                if !map.is_valid() {
                    self.terminate(ErrorCode::InvalidLlParameters);
                } else {
                    self.schedule_instant(instant, InstantUpdate::ChannelMap(map));
                }
            }
            ControlPdu::TerminateInd { error_code } => {
                info!(
                    "[{:?}] peer terminated: {:?}",
                    self.handle, error_code
                );
                self.terminate(error_code);
            }
            ControlPdu::EncReq {
                rand,
                ediv,
                skd_m,
                iv_m,
            } => self.on_enc_req(rand, ediv, skd_m, iv_m, ctx),
            ControlPdu::EncRsp { skd_s, iv_s } => {
                if self.active_phase(ProcedureKind::Encryption) != Some(Phase::AwaitEncRsp) {
                    return self.unexpected(opcode);
                }
                self.enc.set_slave_material(SlaveKeyMaterial { skd_s, iv_s });
                if let Err(e) = self.enc.start_session() {
                    self.terminate(super::connection::crypto_reason(e));
                    return;
                }
                self.set_phase(Phase::AwaitStartEncReq);
                let timeout = self.ctrl_timeout_events();
                self.procedures.restart_timer(timeout);
            }
            ControlPdu::StartEncReq => {
                if self.active_phase(ProcedureKind::Encryption) != Some(Phase::AwaitStartEncReq) {
                    return self.unexpected(opcode);
                }
                if let Err(e) = self.enc.enable_rx().and_then(|_| self.enc.enable_tx()) {
                    self.terminate(super::connection::crypto_reason(e));
                    return;
                }
                self.send_ctrl(ControlPdu::StartEncRsp);
                self.set_phase(Phase::AwaitStartEncRsp);
            }
            ControlPdu::StartEncRsp => match self.role {
                Role::Master => {
                    if self.active_phase(ProcedureKind::Encryption)
                        != Some(Phase::AwaitStartEncRsp)
                    {
                        return self.unexpected(opcode);
                    }
                    self.procedures.complete();
                    self.finish_encryption(ErrorCode::Success, ctx);
                }
                Role::Slave => {
                    if self.procedures.responder() != Some(Responder::AwaitStartEncRsp) {
                        return self.unexpected(opcode);
                    }
                    if let Err(e) = self.enc.enable_tx() {
                        self.terminate(super::connection::crypto_reason(e));
                        return;
                    }
                    self.send_ctrl(ControlPdu::StartEncRsp);
                    let timeout = self.ctrl_timeout_events();
                    self.procedures
                        .set_responder(Responder::AwaitStartEncRspAck, timeout);
                }
            },
            ControlPdu::UnknownRsp { unknown_type } => {
                if self.is_rejection_of_active(unknown_type) {
                    self.fail_active(ErrorCode::UnsupportedRemoteFeature, ctx);
                }
            }
            ControlPdu::FeatureReq { features_master } => {
                self.on_feature_req(features_master)
            }
            ControlPdu::SlaveFeatureReq { features_slave } => self.on_feature_req(features_slave),
            ControlPdu::FeatureRsp { features } => {
                self.store_peer_features(features);
                if self.active_phase(ProcedureKind::FeatureExchange).is_some() {
                    self.procedures.complete();
                    ctx.events.push(HostEvent::RemoteFeatures {
                        handle: self.handle,
                        status: ErrorCode::Success,
                        features,
                    });
                }
            }
            ControlPdu::PauseEncReq => {
                if !self.enc.is_encrypted() {
                    self.reject(opcode, ErrorCode::LlPduNotAllowed);
                    return;
                }
                self.data_paused = true;
                self.send_ctrl(ControlPdu::PauseEncRsp);
                let timeout = self.ctrl_timeout_events();
                self.procedures
                    .set_responder(Responder::AwaitPauseEncRsp, timeout);
            }
            ControlPdu::PauseEncRsp => self.on_pause_enc_rsp(opcode, ctx),
            ControlPdu::VersionInd {
                vers_nr,
                company_id,
                sub_vers_nr,
            } => {
                if self.peer_version.is_some() {
                    warn!("[{:?}] duplicate LL_VERSION_IND ignored", self.handle);
                    return;
                }
                let version = VersionInfo {
                    vers_nr,
                    company_id,
                    sub_vers_nr,
                };
                self.peer_version = Some(version);
                if !self.version_sent {
                    self.send_version();
                }
                if self.active_phase(ProcedureKind::VersionExchange).is_some() {
                    self.procedures.complete();
                    ctx.events.push(HostEvent::RemoteVersion {
                        handle: self.handle,
                        version,
                    });
                }
            }
            ControlPdu::RejectInd { error_code } => {
                // Only encryption and connection parameter requests can get a plain reject.
                match self.procedures.active_kind() {
                    Some(ProcedureKind::Encryption) | Some(ProcedureKind::ConnParamRequest) => {
                        self.fail_active(error_code, ctx)
                    }
                    _ => debug!("[{:?}] stray LL_REJECT_IND", self.handle),
                }
            }
            ControlPdu::RejectExtInd {
                reject_opcode,
                error_code,
            } => {
                if self.is_rejection_of_active(reject_opcode) {
                    self.fail_active(error_code, ctx);
                } else {
                    debug!("[{:?}] stray LL_REJECT_EXT_IND", self.handle);
                }
            }
            ControlPdu::ConnectionParamReq(req) => self.on_conn_param_req(req, ctx),
            ControlPdu::ConnectionParamRsp(rsp) => {
                if self.active_phase(ProcedureKind::ConnParamRequest) != Some(Phase::AwaitResponse)
                {
                    return self.unexpected(opcode);
                }
                match accept_conn_params(&rsp, ctx.min_interval) {
                    Ok(params) => {
                        let instant = self.send_connection_update(params);
                        self.set_phase(Phase::AwaitInstant(instant));
                    }
                    Err(code) => {
                        self.reject(ControlOpcode::ConnectionParamReq, code);
                        self.fail_active(code, ctx);
                    }
                }
            }
            ControlPdu::PingReq => self.send_ctrl(ControlPdu::PingRsp),
            ControlPdu::PingRsp => {
                if self.active_phase(ProcedureKind::Ping).is_some() {
                    self.procedures.complete();
                }
            }
            ControlPdu::LengthReq(remote) => {
                self.send_ctrl(ControlPdu::LengthRsp(self.data_length.local));
                self.update_remote_length(remote, ctx);
            }
            ControlPdu::LengthRsp(remote) => self.update_remote_length(remote, ctx),
            ControlPdu::PhyReq { tx_phys, rx_phys } => match self.role {
                Role::Master => self.send_phy_update(tx_phys, rx_phys),
                Role::Slave => {
                    self.send_ctrl(ControlPdu::PhyRsp {
                        tx_phys: self.phy.preferred_tx,
                        rx_phys: self.phy.preferred_rx,
                    });
                    if self.active_phase(ProcedureKind::PhyUpdate).is_none() {
                        let timeout = self.ctrl_timeout_events();
                        self.procedures
                            .set_responder(Responder::AwaitPhyUpdate, timeout);
                    }
                }
            },
            ControlPdu::PhyRsp { tx_phys, rx_phys } => {
                if self.active_phase(ProcedureKind::PhyUpdate) != Some(Phase::AwaitResponse) {
                    return self.unexpected(opcode);
                }
                self.send_phy_update(tx_phys, rx_phys);
            }
            ControlPdu::PhyUpdateInd {
                m_to_s_phy,
                s_to_m_phy,
                instant,
            } => self.on_phy_update_ind(m_to_s_phy, s_to_m_phy, instant, ctx),
            ControlPdu::MinUsedChannelsInd {
                phys,
                min_used_channels,
            } => {
                debug!(
                    "[{:?}] peer wants >= {} channels on {:?}",
                    self.handle, min_used_channels, phys
                );
            }
            ControlPdu::CteReq {
                min_cte_len,
                cte_type,
            } => self.on_cte_req(min_cte_len, cte_type),
            ControlPdu::CteRsp => {
                if self.active_phase(ProcedureKind::CteRequest).is_none() {
                    return self.unexpected(opcode);
                }
                self.procedures.complete();
                match pdu.cte_info() {
                    Some(info) => ctx.events.push(HostEvent::CteResponse {
                        handle: self.handle,
                        info,
                        rssi: self.stats.last_rssi,
                    }),
                    None => ctx.events.push(HostEvent::CteRequestFailed {
                        handle: self.handle,
                        status: ErrorCode::InvalidLlParameters,
                    }),
                }
            }
            ControlPdu::Unknown { .. } => {}
        }
    }

    /// Answers a PDU that doesn't fit the current procedure state.
    fn unexpected(&mut self, opcode: ControlOpcode) {
        warn!("[{:?}] unexpected {:?}", self.handle, opcode);
        self.send_ctrl(ControlPdu::UnknownRsp {
            unknown_type: opcode,
        });
    }

    /// Returns whether a reject or unknown response citing `opcode` refers to the active
    /// procedure.
    fn is_rejection_of_active(&self, opcode: ControlOpcode) -> bool {
        let active = match self.procedures.active_kind() {
            Some(kind) => kind,
            None => return false,
        };
        if ProcedureKind::initiated_by(opcode) == Some(active) {
            return true;
        }
        matches!(
            (active, opcode),
            (ProcedureKind::VersionExchange, ControlOpcode::VersionInd)
                | (ProcedureKind::ConnParamRequest, ControlOpcode::ConnectionParamRsp)
                | (ProcedureKind::PhyUpdate, ControlOpcode::PhyRsp)
        )
    }

    /// Records an update the master sent with an instant. Returns whether it was accepted.
    fn schedule_instant(&mut self, instant: u16, update: InstantUpdate) -> bool {
        if instant_passed(self.event_counter.0, instant) {
            warn!(
                "[{:?}] instant {} already passed (now {})",
                self.handle, instant, self.event_counter
            );
            self.terminate(ErrorCode::InstantPassed);
            return false;
        }
        if self.pending.is_some() {
            warn!("[{:?}] second update with an instant", self.handle);
            self.terminate(ErrorCode::DifferentTransactionCollision);
            return false;
        }
        self.pending = Some((instant, update));
        true
    }

    fn on_enc_req<T: Trng>(
        &mut self,
        rand: [u8; 8],
        ediv: u16,
        skd_m: [u8; 8],
        iv_m: [u8; 4],
        ctx: &mut EventCtx<'_, T>,
    ) {
        if !self.local_features.contains(FeatureSet::LE_ENCRYPTION) {
            self.send_ctrl(ControlPdu::UnknownRsp {
                unknown_type: ControlOpcode::EncReq,
            });
            return;
        }
        if self.enc.is_encrypted() {
            self.reject(ControlOpcode::EncReq, ErrorCode::LlPduNotAllowed);
            return;
        }
        let material = slave_key_material(ctx);
        let (skd_s, iv_s) = match material {
            Ok(m) => m,
            Err(e) => {
                warn!("[{:?}] no key material for ENC_RSP: {}", self.handle, e);
                self.reject(ControlOpcode::EncReq, ErrorCode::UnspecifiedError);
                return;
            }
        };

        self.enc.set_master_material(MasterKeyMaterial {
            rand,
            ediv,
            skd_m,
            iv_m,
        });
        self.enc.set_slave_material(SlaveKeyMaterial { skd_s, iv_s });
        self.data_paused = true;
        self.send_ctrl(ControlPdu::EncRsp { skd_s, iv_s });

        let timeout = self.ctrl_timeout_events();
        self.procedures.set_responder(Responder::AwaitLtk, timeout);
        ctx.events.push(HostEvent::LtkRequest {
            handle: self.handle,
            rand,
            ediv,
        });
    }

    fn on_pause_enc_rsp<T: Trng>(&mut self, opcode: ControlOpcode, ctx: &mut EventCtx<'_, T>) {
        match self.role {
            Role::Master => {
                if self.active_phase(ProcedureKind::Encryption) != Some(Phase::AwaitPauseEncRsp) {
                    return self.unexpected(opcode);
                }
                self.enc.clear_session();
                self.refreshing = true;
                self.send_ctrl(ControlPdu::PauseEncRsp);
                let material = *self.enc.master_material();
                match self.send_enc_req(material.rand, material.ediv, ctx) {
                    Ok(()) => {
                        self.set_phase(Phase::AwaitEncRsp);
                        let timeout = self.ctrl_timeout_events();
                        self.procedures.restart_timer(timeout);
                    }
                    Err(e) => {
                        warn!("[{:?}] no key material for ENC_REQ: {}", self.handle, e);
                        self.fail_active(ErrorCode::UnspecifiedError, ctx);
                    }
                }
            }
            Role::Slave => {
                if self.procedures.responder() != Some(Responder::AwaitPauseEncRsp) {
                    return self.unexpected(opcode);
                }
                self.enc.clear_session();
                self.refreshing = true;
                self.procedures.clear_responder();
            }
        }
    }

    fn on_feature_req(&mut self, features: FeatureSet) {
        self.store_peer_features(features);
        self.send_ctrl(ControlPdu::FeatureRsp {
            features: self.local_features,
        });
    }

    fn store_peer_features(&mut self, features: FeatureSet) {
        self.peer_features = Some(features);
        self.features = FeatureSet::negotiate(self.local_features, features);
        debug!("[{:?}] features in use: {:?}", self.handle, self.features);
    }

    fn on_conn_param_req<T: Trng>(&mut self, req: ConnParamRequest, ctx: &mut EventCtx<'_, T>) {
        match self.role {
            Role::Master => match accept_conn_params(&req, ctx.min_interval) {
                Ok(params) => {
                    self.send_connection_update(params);
                }
                Err(code) => self.reject(ControlOpcode::ConnectionParamReq, code),
            },
            Role::Slave => match accept_conn_params(&req, 0) {
                Ok(params) => {
                    self.send_ctrl(ControlPdu::ConnectionParamRsp(ConnParamRequest {
                        interval_min: params.interval,
                        interval_max: params.interval,
                        ..req
                    }));
                    let timeout = self.ctrl_timeout_events();
                    self.procedures
                        .set_responder(Responder::AwaitConnUpdate, timeout);
                }
                Err(code) => self.reject(ControlOpcode::ConnectionParamReq, code),
            },
        }
    }

    fn update_remote_length<T: Trng>(
        &mut self,
        remote: LengthParams,
        ctx: &mut EventCtx<'_, T>,
    ) {
        self.data_length.remote = remote;
        if self.data_length.recompute() {
            info!(
                "[{:?}] data length: tx {}/{}µs rx {}/{}µs",
                self.handle,
                self.data_length.eff_tx_octets,
                self.data_length.eff_tx_time,
                self.data_length.eff_rx_octets,
                self.data_length.eff_rx_time
            );
            ctx.events.push(HostEvent::DataLengthChange {
                handle: self.handle,
                length: self.data_length,
            });
        }
        if self.active_phase(ProcedureKind::DataLengthUpdate).is_some() {
            self.procedures.complete();
        }
    }

    /// Master: picks the new PHYs from both preference sets and sends `LL_PHY_UPDATE_IND`.
    ///
    /// `peer_tx`/`peer_rx` are the slave's preferences for its own transmit and receive side.
    fn send_phy_update(&mut self, peer_tx: PhySet, peer_rx: PhySet) {
        let pick = |ours: PhySet, theirs: PhySet, current: Phy| {
            (ours & theirs).fastest().filter(|&phy| phy != current)
        };
        let m_to_s = pick(self.phy.preferred_tx, peer_rx, self.phy.tx);
        let s_to_m = pick(self.phy.preferred_rx, peer_tx, self.phy.rx);
        let local = self.active_phase(ProcedureKind::PhyUpdate).is_some();

        if m_to_s.is_none() && s_to_m.is_none() {
            self.send_ctrl(ControlPdu::PhyUpdateInd {
                m_to_s_phy: PhySet::empty(),
                s_to_m_phy: PhySet::empty(),
                instant: 0,
            });
            if local {
                self.set_phase(Phase::AwaitAck);
            }
            return;
        }

        let instant = self.next_instant();
        let to_set = |phy: Option<Phy>| phy.map_or(PhySet::empty(), Phy::to_set);
        self.pending = Some((
            instant,
            InstantUpdate::Phy {
                tx: m_to_s.unwrap_or(self.phy.tx),
                rx: s_to_m.unwrap_or(self.phy.rx),
            },
        ));
        self.send_ctrl(ControlPdu::PhyUpdateInd {
            m_to_s_phy: to_set(m_to_s),
            s_to_m_phy: to_set(s_to_m),
            instant,
        });
        if local {
            self.set_phase(Phase::AwaitInstant(instant));
        }
    }

    fn on_phy_update_ind<T: Trng>(
        &mut self,
        m_to_s: PhySet,
        s_to_m: PhySet,
        instant: u16,
        ctx: &mut EventCtx<'_, T>,
    ) {
        let local = self.active_phase(ProcedureKind::PhyUpdate).is_some();
        if self.procedures.responder() == Some(Responder::AwaitPhyUpdate) {
            self.procedures.clear_responder();
        }

        if m_to_s.is_empty() && s_to_m.is_empty() {
            // Nothing changes; only a host-initiated update is reported.
            if local {
                self.finish_phy_update(ErrorCode::Success, ctx);
            }
            return;
        }

        let (tx, rx) = match (phy_or(s_to_m, self.phy.tx), phy_or(m_to_s, self.phy.rx)) {
            (Some(tx), Some(rx)) => (tx, rx),
            _ => {
                self.terminate(ErrorCode::InvalidLlParameters);
                return;
            }
        };
        if self.schedule_instant(instant, InstantUpdate::Phy { tx, rx }) && local {
            self.set_phase(Phase::AwaitInstant(instant));
        }
    }

    fn on_cte_req(&mut self, min_cte_len: u8, cte_type: CteType) {
        let opcode = ControlOpcode::CteReq;
        if !self.cte_response_enabled
            || !self
                .local_features
                .contains(FeatureSet::CONNECTION_CTE_RESPONSE)
        {
            self.reject(opcode, ErrorCode::UnsupportedRemoteFeature);
        } else if self.phy.tx == Phy::LeCoded || !CTE_LEN_RANGE.contains(&min_cte_len) {
            self.reject(opcode, ErrorCode::UnsupportedLlParameterValue);
        } else {
            self.cte_rsp_info = Some(CteInfo {
                time: min_cte_len,
                kind: cte_type,
            });
            self.send_ctrl(ControlPdu::CteRsp);
        }
    }

    /// Applies an update whose instant is the event that just started.
    pub(super) fn apply_instant<T: Trng>(
        &mut self,
        update: InstantUpdate,
        ctx: &mut EventCtx<'_, T>,
    ) -> Option<TimingChange> {
        debug!(
            "[{:?}] instant {}: {:?}",
            self.handle, self.event_counter, update
        );
        let local_kind = self.procedures.active_kind();
        match update {
            InstantUpdate::Connection(data) => {
                self.params = ConnParams {
                    interval: data.interval,
                    latency: data.latency,
                    timeout: data.timeout,
                };
                self.win_size = data.win_size;
                if matches!(
                    local_kind,
                    Some(ProcedureKind::ConnectionUpdate) | Some(ProcedureKind::ConnParamRequest)
                ) {
                    self.procedures.complete();
                }
                if self.procedures.responder() == Some(Responder::AwaitConnUpdate) {
                    self.procedures.clear_responder();
                }
                ctx.events.push(HostEvent::ConnectionUpdateComplete {
                    handle: self.handle,
                    status: ErrorCode::Success,
                    params: self.params,
                });
                Some(TimingChange {
                    interval: data.interval(),
                    win_offset: data.win_offset(),
                    win_size: Duration::from_conn_units(u16::from(data.win_size)),
                })
            }
            InstantUpdate::ChannelMap(map) => {
                self.channel_map = map;
                if local_kind == Some(ProcedureKind::ChannelMapUpdate) {
                    self.procedures.complete();
                }
                None
            }
            InstantUpdate::Phy { tx, rx } => {
                self.phy.tx = tx;
                self.phy.rx = rx;
                info!("[{:?}] PHY tx {:?} rx {:?}", self.handle, tx, rx);
                if local_kind == Some(ProcedureKind::PhyUpdate) {
                    self.procedures.complete();
                }
                ctx.events.push(HostEvent::PhyUpdateComplete {
                    handle: self.handle,
                    status: ErrorCode::Success,
                    tx,
                    rx,
                });
                None
            }
        }
    }

    // Host requests. `LinkLayer` resolves the handle and forwards these.

    /// Starts the termination procedure with `reason` (eg. `RemoteUserTerminated`).
    pub(crate) fn disconnect(&mut self, reason: ErrorCode) -> Result<(), Error> {
        self.request(Procedure::Termination(reason))
    }

    /// Requests new connection parameters.
    ///
    /// The master updates directly, picking the shortest interval in range the scheduler can
    /// accommodate. The slave asks the master with `LL_CONNECTION_PARAM_REQ`.
    pub(crate) fn update_connection(
        &mut self,
        interval_min: u16,
        interval_max: u16,
        latency: u16,
        timeout: u16,
        min_interval: u16,
    ) -> Result<(), Error> {
        let req = ConnParamRequest {
            interval_min,
            interval_max,
            latency,
            timeout,
            preferred_periodicity: 0,
            reference_event: self.event_counter.0,
            offsets: [0xFFFF; 6],
        };
        match self.role {
            Role::Master => {
                let params = accept_conn_params(&req, min_interval).map_err(|code| {
                    if code == ErrorCode::UnacceptableConnectionParameters {
                        Error::ResourceExhausted
                    } else {
                        Error::InvalidValue
                    }
                })?;
                self.request(Procedure::ConnectionUpdate {
                    interval: params.interval,
                    latency: params.latency,
                    timeout: params.timeout,
                })
            }
            Role::Slave => {
                accept_conn_params(&req, 0).map_err(|_| Error::InvalidValue)?;
                self.request(Procedure::ConnParamRequest(req))
            }
        }
    }

    /// Switches the master to a new channel map.
    pub(crate) fn set_channel_map(&mut self, map: ChannelMap) -> Result<(), Error> {
        if self.role != Role::Master {
            return Err(Error::InvalidState);
        }
        if !map.is_valid() {
            return Err(Error::InvalidValue);
        }
        self.request(Procedure::ChannelMapUpdate(map))
    }

    pub(crate) fn read_remote_features(&mut self) -> Result<(), Error> {
        self.request(Procedure::FeatureExchange)
    }

    pub(crate) fn read_remote_version(&mut self) -> Result<(), Error> {
        self.request(Procedure::VersionExchange)
    }

    /// Starts (or refreshes) encryption with `ltk`. Master only.
    pub(crate) fn start_encryption(
        &mut self,
        ltk: Key,
        rand: [u8; 8],
        ediv: u16,
    ) -> Result<(), Error> {
        if self.role != Role::Master {
            return Err(Error::InvalidState);
        }
        self.request(Procedure::Encryption { ltk, rand, ediv })
    }

    /// Host answer to `LtkRequest`.
    pub(crate) fn ltk_reply(&mut self, ltk: Key) -> Result<(), Error> {
        if self.procedures.responder() != Some(Responder::AwaitLtk) {
            return Err(Error::InvalidState);
        }
        if self.ctrl_tx.is_full() {
            return Err(Error::ResourceExhausted);
        }
        self.enc.set_ltk(ltk);
        if let Err(e) = self.enc.start_session() {
            self.terminate(super::connection::crypto_reason(e));
            return Err(Error::InvalidState);
        }
        self.send_ctrl(ControlPdu::StartEncReq);
        let timeout = self.ctrl_timeout_events();
        self.procedures
            .set_responder(Responder::AwaitStartEncRsp, timeout);
        Ok(())
    }

    /// Host answer to `LtkRequest` when it has no key.
    pub(crate) fn ltk_negative_reply(&mut self) -> Result<(), Error> {
        if self.procedures.responder() != Some(Responder::AwaitLtk) {
            return Err(Error::InvalidState);
        }
        if self.ctrl_tx.is_full() {
            return Err(Error::ResourceExhausted);
        }
        self.procedures.clear_responder();
        // The connection ends once the reject is out.
        self.reject(ControlOpcode::EncReq, ErrorCode::PinOrKeyMissing);
        self.data_paused = false;
        self.refreshing = false;
        Ok(())
    }

    /// Sets our maximum transmit octets and time, and negotiates them with the peer.
    pub(crate) fn set_data_length(&mut self, tx_octets: u16, tx_time: u16) -> Result<(), Error> {
        if !(MIN_PAYLOAD as u16..=MAX_OCTETS).contains(&tx_octets)
            || !(MIN_PACKET_TIME..=MAX_PACKET_TIME).contains(&tx_time)
        {
            return Err(Error::InvalidValue);
        }
        self.request(Procedure::DataLengthUpdate)?;
        self.data_length.local.max_tx_octets = tx_octets;
        self.data_length.local.max_tx_time = tx_time;
        Ok(())
    }

    /// Requests a PHY change. The sets list the acceptable PHYs per direction.
    pub(crate) fn set_phy(&mut self, tx_phys: PhySet, rx_phys: PhySet) -> Result<(), Error> {
        let mut supported = PhySet::LE_1M;
        if self.local_features.contains(FeatureSet::LE_2M_PHY) {
            supported |= PhySet::LE_2M;
        }
        if self.local_features.contains(FeatureSet::LE_CODED_PHY) {
            supported |= PhySet::LE_CODED;
        }
        if tx_phys.is_empty() || rx_phys.is_empty() || !supported.contains(tx_phys | rx_phys) {
            return Err(Error::InvalidValue);
        }
        self.request(Procedure::PhyUpdate { tx_phys, rx_phys })
    }

    /// Asks the peer to append a CTE to an `LL_CTE_RSP`.
    pub(crate) fn request_cte(&mut self, min_cte_len: u8, cte_type: CteType) -> Result<(), Error> {
        if !CTE_LEN_RANGE.contains(&min_cte_len) {
            return Err(Error::InvalidValue);
        }
        self.request(Procedure::CteRequest {
            min_cte_len,
            cte_type,
        })
    }

    pub(crate) fn set_cte_response_enabled(&mut self, enabled: bool) {
        self.cte_response_enabled = enabled;
    }

    /// Sets the authenticated payload timeout. It must cover at least one full latency period.
    pub(crate) fn set_authenticated_payload_timeout(&mut self, apto: Duration) -> Result<(), Error> {
        let min = self.interval() * (1 + u32::from(self.params.latency));
        if apto.as_micros() < min.as_micros() {
            return Err(Error::InvalidValue);
        }
        self.apto = apto;
        Ok(())
    }
}

/// Checks a connection parameter request and picks the interval to use.
///
/// The shortest interval in the requested range that is at least `min_interval` wins.
fn accept_conn_params(req: &ConnParamRequest, min_interval: u16) -> Result<ConnParams, ErrorCode> {
    let range_ok = (6..=3200).contains(&req.interval_min)
        && (6..=3200).contains(&req.interval_max)
        && req.interval_min <= req.interval_max
        && req.latency <= 499
        && (10..=3200).contains(&req.timeout);
    let timeout_ok = u32::from(req.timeout) * 4
        > (1 + u32::from(req.latency)) * u32::from(req.interval_max);
    if !range_ok || !timeout_ok {
        return Err(ErrorCode::InvalidLlParameters);
    }
    let interval = req.interval_min.max(min_interval);
    if interval > req.interval_max {
        return Err(ErrorCode::UnacceptableConnectionParameters);
    }
    Ok(ConnParams {
        interval,
        latency: req.latency,
        timeout: req.timeout,
    })
}

fn slave_key_material<T: Trng>(ctx: &mut EventCtx<'_, T>) -> Result<([u8; 8], [u8; 4]), Error> {
    let skd_s = ctx.rng.key_bytes::<8>()?;
    let iv_s = ctx.rng.key_bytes::<4>()?;
    Ok((skd_s, iv_s))
}

/// Decodes a PHY field of `LL_PHY_UPDATE_IND`: empty keeps `current`, otherwise exactly one bit.
fn phy_or(set: PhySet, current: Phy) -> Option<Phy> {
    if set.is_empty() {
        Some(current)
    } else {
        set.single()
    }
}
