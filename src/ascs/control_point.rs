use bytes::Bytes;
use instructor::Buffer;
use tracing::{debug, warn};

use crate::ascs::endpoint::{AseState, Endpoint};
use crate::ascs::error::{Reason, ResponseCode, Rsp};
use crate::ascs::packets::{ConfigCodecParams, ConfigQosParams, ControlPointResponse, MetadataParams, Opcode, Request};
use crate::ascs::pool::AseHandle;
use crate::ascs::server::AscsState;
use crate::audio::ltv::{self, validate_metadata, MetadataError};
use crate::audio::{AseKey, CodecConfig, Direction, TargetLatency, TargetPhy, VENDOR_CODEC_ID};
use crate::ensure;
use crate::iso::{IoQos, IsoRef};

/// Highest CIG and CIS id a client may assign ([Vol 4] Part E, Section 7.8.97).
const MAX_CIG_CIS_ID: u8 = 0xEF;

pub(crate) fn metadata_rsp(err: MetadataError) -> Rsp {
    match err {
        MetadataError::Malformed => Rsp::metadata(ResponseCode::MetadataInvalid, 0x00),
        MetadataError::Invalid(kind) => Rsp::metadata(ResponseCode::MetadataInvalid, kind),
        MetadataError::Rejected(kind) => Rsp::metadata(ResponseCode::MetadataRejected, kind)
    }
}

fn outcome(result: Result<(), Rsp>) -> Rsp {
    match result {
        Ok(()) => Rsp::SUCCESS,
        Err(rsp) => rsp
    }
}

impl AscsState {
    /// Processes one control point write and returns the aggregated response.
    ///
    /// A write that fails the length check does not touch any ASE.
    pub fn handle_control_point(&mut self, conn: u16, mut data: Bytes) -> ControlPointResponse {
        let Ok(raw) = data.read_le::<u8>() else {
            return ControlPointResponse::unsupported(0x00);
        };
        let Ok(opcode) = Opcode::try_from(raw) else {
            warn!("Unsupported control point opcode 0x{:02X}", raw);
            return ControlPointResponse::unsupported(raw);
        };
        let request = match Request::parse(opcode, data) {
            Ok(request) => request,
            Err(code) => {
                warn!("Rejecting {:?} from 0x{:04X}: {}", opcode, conn, code);
                return ControlPointResponse::invalid_length(opcode);
            }
        };
        debug!("Control point {:?} from 0x{:04X}", opcode, conn);

        let mut rsp = ControlPointResponse::new(opcode);
        match request {
            Request::ConfigCodec(blocks) => blocks.into_iter().for_each(|params| {
                let id = params.ase_id;
                rsp.push(id, outcome(self.config_codec(conn, params)));
            }),
            Request::ConfigQos(blocks) => blocks.into_iter().for_each(|params| {
                rsp.push(params.ase_id, outcome(self.config_qos(conn, &params)));
            }),
            Request::Enable(blocks) => blocks.into_iter().for_each(|params| {
                let id = params.ase_id;
                rsp.push(id, outcome(self.enable(conn, params)));
            }),
            Request::ReceiverStartReady(ids) => ids.into_iter().for_each(|id| {
                rsp.push(id, outcome(self.receiver_start_ready(AseKey::new(conn, id))));
            }),
            Request::Disable(ids) => ids.into_iter().for_each(|id| {
                rsp.push(id, outcome(self.disable_ase(AseKey::new(conn, id))));
            }),
            Request::ReceiverStopReady(ids) => ids.into_iter().for_each(|id| {
                rsp.push(id, outcome(self.receiver_stop_ready(AseKey::new(conn, id))));
            }),
            Request::UpdateMetadata(blocks) => blocks.into_iter().for_each(|params| {
                let id = params.ase_id;
                rsp.push(id, outcome(self.update_metadata_ase(conn, params)));
            }),
            Request::Release(ids) => ids.into_iter().for_each(|id| {
                rsp.push(id, outcome(self.release_ase(AseKey::new(conn, id))));
            })
        }
        rsp
    }

    /// Resolves an addressed ASE that must already be in use.
    fn resolve(&self, key: AseKey) -> Result<(AseHandle, AseState), Rsp> {
        ensure!(self.direction(key.id).is_some(), ResponseCode::InvalidAseId);
        let handle = self.pool.find(key).ok_or_else(|| {
            debug!("{}: operation on an idle ASE", key);
            ResponseCode::InvalidAseState
        })?;
        let state = self
            .pool
            .get(handle)
            .map(Endpoint::effective_state)
            .unwrap_or_default();
        Ok((handle, state))
    }

    fn config_codec(&mut self, conn: u16, params: ConfigCodecParams) -> Result<(), Rsp> {
        let key = AseKey::new(conn, params.ase_id);
        let dir = self.direction(key.id).ok_or(ResponseCode::InvalidAseId)?;
        let invalid = Rsp::new(ResponseCode::ConfInvalid, Reason::None);
        let target_latency = TargetLatency::try_from(params.target_latency).map_err(|_| invalid)?;
        let target_phy = TargetPhy::try_from(params.target_phy).map_err(|_| invalid)?;
        ensure!(
            self.handler.codec_supported(dir, &params.codec),
            Rsp::new(ResponseCode::UnsupportedAudioCapabilities, Reason::CodecId),
            "{}: unsupported codec {:?}", key, params.codec
        );
        ensure!(
            params.codec.id == VENDOR_CODEC_ID || ltv::is_valid(&params.cc),
            Rsp::new(ResponseCode::ConfInvalid, Reason::CodecSpecificConfiguration),
            "{}: malformed codec specific configuration", key
        );
        let codec = CodecConfig {
            id: params.codec,
            target_latency,
            target_phy,
            data: params.cc
        };

        match self.pool.find(key) {
            Some(handle) => {
                let ep = self.pool.get_mut(handle).ok_or(ResponseCode::Unspecified)?;
                let state = ep.effective_state();
                ensure!(
                    matches!(state, AseState::CodecConfigured | AseState::QosConfigured),
                    ResponseCode::InvalidAseState,
                    "{}: cannot configure codec in {:?}", key, state
                );
                let backup = std::mem::replace(&mut ep.codec, codec);
                let mut pref = ep.qos_pref;
                if let Err(rsp) = self.handler.reconfig(key, dir, &ep.codec, &mut pref) {
                    debug!("{}: reconfiguration rejected: {}", key, rsp);
                    ep.codec = backup;
                    return Err(rsp.normalize());
                }
                ep.qos_pref = pref;
                self.request_state(handle, AseState::CodecConfigured);
            }
            None => {
                ensure!(self.pool.has_free(), ResponseCode::InsufficientResources, "{}: no free ASE slot", key);
                let (stream, pref) = self.handler.config(key, dir, &codec).map_err(|rsp| {
                    debug!("{}: configuration rejected: {}", key, rsp);
                    rsp.normalize()
                })?;
                let mut ep = Endpoint::new(key, dir, stream);
                ep.codec = codec;
                ep.qos_pref = pref;
                let handle = self.pool.alloc(ep).ok_or(ResponseCode::InsufficientResources)?;
                self.request_state(handle, AseState::CodecConfigured);
            }
        }
        Ok(())
    }

    fn config_qos(&mut self, conn: u16, params: &ConfigQosParams) -> Result<(), Rsp> {
        let key = AseKey::new(conn, params.ase_id);
        let (handle, state) = self.resolve(key)?;
        ensure!(
            matches!(state, AseState::CodecConfigured | AseState::QosConfigured),
            ResponseCode::InvalidAseState,
            "{}: cannot configure QoS in {:?}", key, state
        );
        let mapping = Rsp::new(ResponseCode::ConfInvalid, Reason::InvalidAseCisMapping);
        ensure!(params.cig_id <= MAX_CIG_CIS_ID && params.cis_id <= MAX_CIG_CIS_ID, mapping);

        let qos = params.qos();
        qos.validate()?;
        let ep = self.pool.get(handle).ok_or(ResponseCode::Unspecified)?;
        ep.qos_pref.check(&qos)?;

        let iso_ep = ep.iso_endpoint();
        let matches = |acl: u16, cig: u8, cis: u8| acl == conn && cig == params.cig_id && cis == params.cis_id;
        let current = ep
            .iso()
            .filter(|iso| {
                let binding = iso.lock();
                matches(binding.acl, binding.cig_id, binding.cis_id)
            })
            .cloned();
        let target = match current {
            Some(iso) => iso,
            None => match self.iso.find(|binding| matches(binding.acl, binding.cig_id, binding.cis_id)) {
                Some(iso) => {
                    ensure!(iso.lock().endpoint(iso_ep.data_dir()).is_none(), mapping, "{}: CIS {} already carries a {:?} ASE", key, params.cis_id, iso_ep.dir);
                    iso
                }
                None => {
                    let iso = self.iso.alloc().ok_or(ResponseCode::InsufficientResources)?;
                    {
                        let mut binding = iso.lock();
                        binding.acl = conn;
                        binding.cig_id = params.cig_id;
                        binding.cis_id = params.cis_id;
                    }
                    iso
                }
            }
        };

        self.handler.qos(key, &qos).map_err(Rsp::normalize)?;

        let ep = self.pool.get_mut(handle).ok_or(ResponseCode::Unspecified)?;
        if !ep.iso().is_some_and(|iso| IsoRef::same_binding(iso, &target)) {
            ep.unbind_iso();
            ep.bind_iso(&target);
        }
        *target.lock().qos_mut(iso_ep.data_dir()) = IoQos {
            interval: qos.interval,
            sdu: qos.sdu,
            phy: qos.phy,
            rtn: qos.rtn,
            latency: qos.latency
        };
        ep.qos = qos;
        ep.cig_id = params.cig_id;
        ep.cis_id = params.cis_id;
        self.request_state(handle, AseState::QosConfigured);
        Ok(())
    }

    fn check_metadata(&self, key: AseKey, dir: Direction, metadata: &[u8]) -> Result<(), Rsp> {
        let available = self.handler.available_contexts(key.conn, dir);
        validate_metadata(metadata, dir, available).map_err(|err| {
            warn!("{}: {}", key, err);
            metadata_rsp(err)
        })?;
        Ok(())
    }

    fn enable(&mut self, conn: u16, params: MetadataParams) -> Result<(), Rsp> {
        let key = AseKey::new(conn, params.ase_id);
        let (handle, state) = self.resolve(key)?;
        ensure!(state == AseState::QosConfigured, ResponseCode::InvalidAseState, "{}: cannot enable in {:?}", key, state);
        let dir = self.direction(key.id).ok_or(ResponseCode::InvalidAseId)?;
        self.check_metadata(key, dir, &params.metadata)?;
        self.handler.enable(key, &params.metadata).map_err(Rsp::normalize)?;
        if let Some(ep) = self.pool.get_mut(handle) {
            ep.metadata = params.metadata;
        }
        self.request_state(handle, AseState::Enabling);
        Ok(())
    }

    fn receiver_start_ready(&mut self, key: AseKey) -> Result<(), Rsp> {
        let (handle, state) = self.resolve(key)?;
        let ep = self.pool.get(handle).ok_or(ResponseCode::Unspecified)?;
        ensure!(ep.dir == Direction::Source, ResponseCode::InvalidAseDirection, "{}: start ready on a sink ASE", key);
        ensure!(state == AseState::Enabling, ResponseCode::InvalidAseState, "{}: cannot start in {:?}", key, state);
        ensure!(
            ep.iso().is_some_and(|iso| iso.lock().is_connected()),
            ResponseCode::InvalidAseState,
            "{}: the CIS is not connected yet", key
        );
        self.handler.start(key).map_err(Rsp::normalize)?;
        if let Some(ep) = self.pool.get_mut(handle) {
            ep.receiver_ready = true;
        }
        self.request_state(handle, AseState::Streaming);
        Ok(())
    }

    fn disable_ase(&mut self, key: AseKey) -> Result<(), Rsp> {
        let (handle, state) = self.resolve(key)?;
        ensure!(
            matches!(state, AseState::Enabling | AseState::Streaming),
            ResponseCode::InvalidAseState,
            "{}: cannot disable in {:?}", key, state
        );
        self.handler.disable(key).map_err(Rsp::normalize)?;
        let target = match self.direction(key.id) {
            Some(Direction::Source) => AseState::Disabling,
            _ => AseState::QosConfigured
        };
        self.request_state(handle, target);
        Ok(())
    }

    fn receiver_stop_ready(&mut self, key: AseKey) -> Result<(), Rsp> {
        let (handle, state) = self.resolve(key)?;
        ensure!(
            self.direction(key.id) == Some(Direction::Source),
            ResponseCode::InvalidAseDirection,
            "{}: stop ready on a sink ASE", key
        );
        ensure!(state == AseState::Disabling, ResponseCode::InvalidAseState, "{}: cannot stop in {:?}", key, state);
        self.handler.stop(key).map_err(Rsp::normalize)?;
        if let Some(ep) = self.pool.get_mut(handle) {
            ep.receiver_ready = false;
        }
        self.request_state(handle, AseState::QosConfigured);
        Ok(())
    }

    fn update_metadata_ase(&mut self, conn: u16, params: MetadataParams) -> Result<(), Rsp> {
        let key = AseKey::new(conn, params.ase_id);
        let (handle, state) = self.resolve(key)?;
        ensure!(
            matches!(state, AseState::Enabling | AseState::Streaming),
            ResponseCode::InvalidAseState,
            "{}: cannot update metadata in {:?}", key, state
        );
        let dir = self.direction(key.id).ok_or(ResponseCode::InvalidAseId)?;
        self.check_metadata(key, dir, &params.metadata)?;
        let ep = self.pool.get_mut(handle).ok_or(ResponseCode::Unspecified)?;
        let backup = std::mem::replace(&mut ep.metadata, params.metadata);
        if let Err(rsp) = self.handler.metadata(key, &ep.metadata) {
            debug!("{}: metadata rejected: {}", key, rsp);
            ep.metadata = backup;
            return Err(rsp.normalize());
        }
        self.request_state(handle, state);
        Ok(())
    }

    fn release_ase(&mut self, key: AseKey) -> Result<(), Rsp> {
        let (handle, state) = self.resolve(key)?;
        ensure!(
            !matches!(state, AseState::Idle | AseState::Releasing),
            ResponseCode::InvalidAseState,
            "{}: cannot release in {:?}", key, state
        );
        self.handler.release(key).map_err(Rsp::normalize)?;
        self.request_state(handle, AseState::Releasing);
        Ok(())
    }
}
