//! GB28181 → RTMP muxing.
//!
//! One muxer per session. TS messages arrive in pack order; video is
//! re-packaged NAL by NAL, audio frame by frame, and everything funnels
//! through the DTS queue into the RTMP client. Frame-level input problems
//! drop that message and are counted; a publish failure closes the client,
//! and the next frame reconnects after a kickoff delay with the sequence
//! headers re-armed.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use gblink_ps_core::{PsCodec, TsMessage};

use crate::aac::{
    AudioCodec, RawAacStream, RawAacStreamCodec, AAC_PACKET_RAW, AAC_PACKET_SEQUENCE_HEADER,
    SOUND_RATE_44100,
};
use crate::avc::{
    RawH264Stream, AVC_PACKET_NALU, AVC_PACKET_SEQUENCE_HEADER, FRAME_TYPE_INTER, FRAME_TYPE_KEY,
};
use crate::error::{Error, Result};
use crate::queue::{FrameKind, MediaFrame, MpegpsQueue};
use crate::rtmp::{RtmpClient, RtmpUrl};

/// Minimum wait between reconnect attempts to the RTMP server.
const RTMP_KICKOFF: Duration = Duration::from_secs(3);

/// Muxer-side counters, reported in the session's periodic statistics line.
#[derive(Debug, Default, Clone, Copy)]
pub struct MuxerStats {
    /// Frames delivered to the RTMP connection.
    pub frames_out: u64,
    /// Messages or frames dropped for malformed input or missing headers.
    pub msgs_dropped: u64,
    /// Times the RTMP connection was torn down.
    pub reconnects: u64,
}

pub struct GbMuxer {
    /// `rtmp://host/app/[stream]`; `[stream]` resolves to the device id.
    output_template: String,
    stream_name: String,
    client: Option<RtmpClient>,
    last_connect_attempt: Option<Instant>,

    avc: RawH264Stream,
    h264_sps: Bytes,
    h264_pps: Bytes,
    h264_sps_changed: bool,
    h264_pps_changed: bool,
    h264_sps_pps_sent: bool,

    #[cfg(feature = "h265")]
    hevc: crate::hevc::RawHevcStream,
    #[cfg(feature = "h265")]
    h265_vps: Bytes,
    #[cfg(feature = "h265")]
    h265_sps: Bytes,
    #[cfg(feature = "h265")]
    h265_pps: Bytes,
    #[cfg(feature = "h265")]
    h265_changed: bool,
    #[cfg(feature = "h265")]
    h265_sent: bool,

    aac: RawAacStream,
    aac_specific_config: Bytes,

    queue: MpegpsQueue,
    stats: MuxerStats,
}

impl GbMuxer {
    pub fn new(output_template: String) -> Self {
        Self {
            output_template,
            stream_name: String::new(),
            client: None,
            last_connect_attempt: None,
            avc: RawH264Stream::new(),
            h264_sps: Bytes::new(),
            h264_pps: Bytes::new(),
            h264_sps_changed: false,
            h264_pps_changed: false,
            h264_sps_pps_sent: false,
            #[cfg(feature = "h265")]
            hevc: crate::hevc::RawHevcStream::new(),
            #[cfg(feature = "h265")]
            h265_vps: Bytes::new(),
            #[cfg(feature = "h265")]
            h265_sps: Bytes::new(),
            #[cfg(feature = "h265")]
            h265_pps: Bytes::new(),
            #[cfg(feature = "h265")]
            h265_changed: false,
            #[cfg(feature = "h265")]
            h265_sent: false,
            aac: RawAacStream::new(),
            aac_specific_config: Bytes::new(),
            queue: MpegpsQueue::new(),
            stats: MuxerStats::default(),
        }
    }

    /// The RTMP stream is named after the device id, which the session only
    /// learns once SIP (or the control API) identifies the peer.
    pub fn set_stream_name(&mut self, name: &str) {
        if self.stream_name != name {
            self.stream_name = name.to_string();
        }
    }

    pub fn stats(&self) -> MuxerStats {
        self.stats
    }

    /// Re-arm the sequence headers after a media transport restart, so the
    /// downstream player resynchronises over the timestamp discontinuity.
    pub fn reset(&mut self) {
        self.reset_sequence_headers();
    }

    /// Mux one elementary-stream message into the RTMP publication.
    pub async fn on_ts_message(&mut self, msg: &TsMessage) -> Result<()> {
        if !self.ensure_connected().await {
            self.stats.msgs_dropped += 1;
            return Ok(());
        }

        let r = if msg.is_video() {
            match msg.codec {
                PsCodec::H264 => self.on_ts_video_h264(msg).await,
                #[cfg(feature = "h265")]
                PsCodec::H265 => self.on_ts_video_h265(msg).await,
                other => Err(Error::UnsupportedCodec(other)),
            }
        } else {
            self.on_ts_audio(msg).await
        };

        match r {
            Err(e) if e.is_media_frame() => {
                self.stats.msgs_dropped += 1;
                tracing::debug!(error = %e, sid = msg.sid, "dropped malformed media message");
                Ok(())
            }
            other => other,
        }
    }

    async fn ensure_connected(&mut self) -> bool {
        if self.client.is_some() {
            return true;
        }
        if self.stream_name.is_empty() {
            return false;
        }
        if let Some(at) = self.last_connect_attempt {
            if at.elapsed() < RTMP_KICKOFF {
                return false;
            }
        }
        self.last_connect_attempt = Some(Instant::now());

        let output = self.output_template.replace("[stream]", &self.stream_name);
        let url = match RtmpUrl::parse(&output) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(error = %e, output, "bad rtmp output url");
                return false;
            }
        };
        match RtmpClient::connect(&url).await {
            Ok(client) => {
                tracing::info!(stream = %self.stream_name, output, "rtmp output connected");
                self.client = Some(client);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, output, "rtmp connect failed");
                false
            }
        }
    }

    async fn on_ts_video_h264(&mut self, msg: &TsMessage) -> Result<()> {
        let dts = (msg.dts / 90) as u32;
        let pts = (msg.pts / 90) as u32;

        let mut avs = Bytes::copy_from_slice(&msg.payload);
        while !avs.is_empty() {
            let frame = self.avc.annexb_demux(&mut avs)?;
            if frame.is_empty() {
                continue;
            }

            if self.avc.is_sps(&frame) {
                let sps = self.avc.sps_demux(&frame)?;
                if self.h264_sps != sps {
                    self.h264_sps_changed = true;
                    self.h264_sps = sps;
                }
                continue;
            }
            if self.avc.is_pps(&frame) {
                let pps = self.avc.pps_demux(&frame)?;
                if self.h264_pps != pps {
                    self.h264_pps_changed = true;
                    self.h264_pps = pps;
                }
                continue;
            }
            if self.avc.is_aud(&frame) {
                continue;
            }

            self.write_h264_sps_pps(dts, pts).await?;
            self.write_h264_ipb_frame(&frame, dts, pts).await?;
        }
        Ok(())
    }

    async fn write_h264_sps_pps(&mut self, dts: u32, pts: u32) -> Result<()> {
        if self.h264_sps_pps_sent && !self.h264_sps_changed && !self.h264_pps_changed {
            return Ok(());
        }
        // Hold off until both parameter sets have been seen.
        if self.h264_sps.is_empty() || self.h264_pps.is_empty() {
            return Ok(());
        }

        let sh = self.avc.mux_sequence_header(&self.h264_sps, &self.h264_pps)?;
        let flv = self
            .avc
            .mux_avc2flv(&sh, FRAME_TYPE_KEY, AVC_PACKET_SEQUENCE_HEADER, dts, pts);
        self.rtmp_write_packet(FrameKind::Video, dts, flv).await?;

        self.h264_sps_changed = false;
        self.h264_pps_changed = false;
        self.h264_sps_pps_sent = true;
        Ok(())
    }

    async fn write_h264_ipb_frame(&mut self, frame: &[u8], dts: u32, pts: u32) -> Result<()> {
        // Frames before the first sequence header cannot be decoded.
        if !self.h264_sps_pps_sent {
            self.stats.msgs_dropped += 1;
            return Ok(());
        }

        let frame_type = if self.avc.is_idr(frame) {
            FRAME_TYPE_KEY
        } else {
            FRAME_TYPE_INTER
        };
        let ibp = self.avc.mux_ipb_frame(frame);
        let flv = self.avc.mux_avc2flv(&ibp, frame_type, AVC_PACKET_NALU, dts, pts);
        self.rtmp_write_packet(FrameKind::Video, dts, flv).await
    }

    #[cfg(feature = "h265")]
    async fn on_ts_video_h265(&mut self, msg: &TsMessage) -> Result<()> {
        let dts = (msg.dts / 90) as u32;
        let pts = (msg.pts / 90) as u32;

        let mut avs = Bytes::copy_from_slice(&msg.payload);
        while !avs.is_empty() {
            let frame = self.hevc.annexb_demux(&mut avs)?;
            if frame.is_empty() {
                continue;
            }

            if self.hevc.is_vps(&frame) {
                if self.h265_vps != frame {
                    self.h265_changed = true;
                    self.h265_vps = frame;
                }
                continue;
            }
            if self.hevc.is_sps(&frame) {
                if self.h265_sps != frame {
                    self.h265_changed = true;
                    self.h265_sps = frame;
                }
                continue;
            }
            if self.hevc.is_pps(&frame) {
                if self.h265_pps != frame {
                    self.h265_changed = true;
                    self.h265_pps = frame;
                }
                continue;
            }

            self.write_h265_vps_sps_pps(dts, pts).await?;
            self.write_h265_ipb_frame(&frame, dts, pts).await?;
        }
        Ok(())
    }

    #[cfg(feature = "h265")]
    async fn write_h265_vps_sps_pps(&mut self, dts: u32, pts: u32) -> Result<()> {
        if self.h265_sent && !self.h265_changed {
            return Ok(());
        }
        if self.h265_vps.is_empty() || self.h265_sps.is_empty() || self.h265_pps.is_empty() {
            return Ok(());
        }

        let sh = self
            .hevc
            .mux_sequence_header(&self.h265_vps, &self.h265_sps, &self.h265_pps)?;
        let flv = self
            .hevc
            .mux_hevc2flv(&sh, FRAME_TYPE_KEY, AVC_PACKET_SEQUENCE_HEADER, dts, pts);
        self.rtmp_write_packet(FrameKind::Video, dts, flv).await?;

        self.h265_changed = false;
        self.h265_sent = true;
        Ok(())
    }

    #[cfg(feature = "h265")]
    async fn write_h265_ipb_frame(&mut self, frame: &[u8], dts: u32, pts: u32) -> Result<()> {
        if !self.h265_sent {
            self.stats.msgs_dropped += 1;
            return Ok(());
        }

        let frame_type = if self.hevc.is_keyframe(frame) {
            FRAME_TYPE_KEY
        } else {
            FRAME_TYPE_INTER
        };
        let ibp = self.hevc.mux_ipb_frame(frame);
        let flv = self.hevc.mux_hevc2flv(&ibp, frame_type, AVC_PACKET_NALU, dts, pts);
        self.rtmp_write_packet(FrameKind::Video, dts, flv).await
    }

    async fn on_ts_audio(&mut self, msg: &TsMessage) -> Result<()> {
        let dts = (msg.dts / 90) as u32;

        match msg.codec {
            PsCodec::Aac => {
                let mut avs = Bytes::copy_from_slice(&msg.payload);
                while !avs.is_empty() {
                    let mut codec = RawAacStreamCodec::default();
                    let frame = self.aac.adts_demux(&mut avs, &mut codec)?;

                    if self.aac_specific_config.is_empty() {
                        let sh = self.aac.mux_sequence_header(&codec)?;
                        self.aac_specific_config = sh.clone();

                        let mut sh_codec = codec.clone();
                        sh_codec.aac_packet_type = AAC_PACKET_SEQUENCE_HEADER;
                        let flv = self.aac.mux_aac2flv(&sh, &sh_codec, dts);
                        self.rtmp_write_packet(FrameKind::Audio, dts, flv).await?;
                    }

                    if frame.is_empty() {
                        continue;
                    }
                    let mut raw_codec = codec.clone();
                    raw_codec.aac_packet_type = AAC_PACKET_RAW;
                    let flv = self.aac.mux_aac2flv(&frame, &raw_codec, dts);
                    self.rtmp_write_packet(FrameKind::Audio, dts, flv).await?;
                }
                Ok(())
            }
            PsCodec::Mp3 | PsCodec::Opus | PsCodec::Speex => {
                let codec = RawAacStreamCodec {
                    sound_format: match msg.codec {
                        PsCodec::Mp3 => AudioCodec::Mp3,
                        PsCodec::Opus => AudioCodec::Opus,
                        _ => AudioCodec::Speex,
                    },
                    sound_rate: Some(SOUND_RATE_44100),
                    sound_size: 1,
                    sound_type: 1,
                    ..RawAacStreamCodec::default()
                };
                let flv = self.aac.mux_aac2flv(&msg.payload, &codec, dts);
                self.rtmp_write_packet(FrameKind::Audio, dts, flv).await
            }
            other => Err(Error::UnsupportedCodec(other)),
        }
    }

    /// Queue one RTMP tag payload and drain whatever the DTS queue releases.
    async fn rtmp_write_packet(&mut self, kind: FrameKind, timestamp: u32, payload: Bytes) -> Result<()> {
        self.queue
            .push(timestamp as u64, MediaFrame { kind, timestamp, payload });

        while let Some(frame) = self.queue.dequeue() {
            let Some(client) = self.client.as_mut() else {
                break;
            };
            let sent = match frame.kind {
                FrameKind::Audio => client.publish_audio(frame.timestamp, frame.payload).await,
                FrameKind::Video => client.publish_video(frame.timestamp, frame.payload).await,
            };
            match sent {
                Ok(()) => self.stats.frames_out += 1,
                Err(e) => {
                    tracing::warn!(error = %e, stream = %self.stream_name, "rtmp publish failed, reconnecting");
                    self.close();
                    break;
                }
            }
        }
        Ok(())
    }

    /// Drop the RTMP connection; the next frame reconnects after the kickoff
    /// delay and re-emits the sequence headers.
    pub fn close(&mut self) {
        if self.client.take().is_some() {
            self.stats.reconnects += 1;
        }
        self.last_connect_attempt = Some(Instant::now());
        self.reset_sequence_headers();
    }

    fn reset_sequence_headers(&mut self) {
        self.h264_sps_pps_sent = false;
        self.aac_specific_config = Bytes::new();
        #[cfg(feature = "h265")]
        {
            self.h265_sent = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn video_msg(payload: &[u8], dts: u64) -> TsMessage {
        TsMessage {
            pack_id: 0,
            sid: 0xe0,
            codec: PsCodec::H264,
            pts: dts,
            dts,
            payload: BytesMut::from(payload),
        }
    }

    fn annexb(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&[0, 0, 1]);
            out.extend_from_slice(nal);
        }
        out
    }

    #[tokio::test]
    async fn sequence_header_waits_for_sps_and_pps() {
        let mut m = GbMuxer::new("rtmp://127.0.0.1/live/[stream]".into());

        // SPS alone: nothing emitted, frames dropped.
        let sps = [0x67, 0x64, 0x00, 0x1f, 0xaa];
        let idr = [0x65, 0x11, 0x22];
        let msg = video_msg(&annexb(&[&sps, &idr]), 90_000);
        m.on_ts_video_h264(&msg).await.unwrap();
        assert!(!m.h264_sps_pps_sent);
        assert_eq!(m.queue.len(), 0);

        // PPS arrives: the next frame emits the header then the IDR.
        let pps = [0x68, 0xee];
        let msg = video_msg(&annexb(&[&pps, &idr]), 93_600);
        m.on_ts_video_h264(&msg).await.unwrap();
        assert!(m.h264_sps_pps_sent);
        assert!(!m.h264_sps_changed && !m.h264_pps_changed);
        assert_eq!(m.queue.len(), 2);
    }

    #[tokio::test]
    async fn changed_sps_rearms_the_sequence_header() {
        let mut m = GbMuxer::new("rtmp://127.0.0.1/live/[stream]".into());

        let sps1 = [0x67, 0x64, 0x00, 0x1f, 0xaa];
        let sps2 = [0x67, 0x64, 0x00, 0x28, 0xbb];
        let pps = [0x68, 0xee];
        let idr = [0x65, 0x01];

        let msg = video_msg(&annexb(&[&sps1, &pps, &idr]), 0);
        m.on_ts_video_h264(&msg).await.unwrap();
        let sent_before = m.queue.len();

        // Same parameter sets again: no new sequence header.
        let msg = video_msg(&annexb(&[&sps1, &pps, &idr]), 3600);
        m.on_ts_video_h264(&msg).await.unwrap();
        assert_eq!(m.queue.len(), sent_before + 1);

        // A different SPS re-emits it.
        let msg = video_msg(&annexb(&[&sps2, &pps, &idr]), 7200);
        m.on_ts_video_h264(&msg).await.unwrap();
        assert_eq!(m.queue.len(), sent_before + 3);
    }

    #[tokio::test]
    async fn video_without_start_code_is_an_error() {
        let mut m = GbMuxer::new("rtmp://127.0.0.1/live/[stream]".into());
        let msg = video_msg(&[0x00, 0x00, 0x02, 0x65], 0);
        let err = m.on_ts_video_h264(&msg).await.unwrap_err();
        assert!(err.is_media_frame());
    }

    #[tokio::test]
    async fn aac_sequence_header_emitted_once_until_reset() {
        let mut m = GbMuxer::new("rtmp://127.0.0.1/live/[stream]".into());

        // One ADTS frame, 44.1kHz mono, one raw byte.
        let adts = [0xff, 0xf9, 0x10, 0x40, 0x01, 0x00, 0x00, 0x01];
        let msg = TsMessage {
            pack_id: 0,
            sid: 0xc0,
            codec: PsCodec::Aac,
            pts: 1800,
            dts: 1800,
            payload: BytesMut::from(&adts[..]),
        };

        m.on_ts_audio(&msg).await.unwrap();
        assert!(!m.aac_specific_config.is_empty());
        assert_eq!(m.queue.len(), 2); // sequence header + raw frame

        m.on_ts_audio(&msg).await.unwrap();
        assert_eq!(m.queue.len(), 3);

        m.reset();
        assert!(m.aac_specific_config.is_empty());
        m.on_ts_audio(&msg).await.unwrap();
        assert_eq!(m.queue.len(), 5);
    }

    #[tokio::test]
    async fn unconnected_muxer_drops_quietly() {
        let mut m = GbMuxer::new("rtmp://127.0.0.1/live/[stream]".into());
        // No stream name yet: nothing to connect to.
        let msg = video_msg(&annexb(&[&[0x65, 0x01]]), 0);
        m.on_ts_message(&msg).await.unwrap();
        assert_eq!(m.stats().msgs_dropped, 1);
    }
}
