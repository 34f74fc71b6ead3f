use std::sync::Arc;

use axum::extract::ws::Message;
use futures_util::StreamExt;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::characters::{build_system_prompt, CharacterRegistry};
use crate::config::ConversationConfig;
use crate::protocol::frame::{AudioFormat, BinaryFrame};
use crate::protocol::messages::ServerEvent;
use crate::services::audio::opus_codec::OpusEgress;
use crate::services::registry::ProviderRegistry;
use crate::session::segmenter::SentenceSegmenter;
use crate::session::{Outbound, Phase, TurnEvent, TurnHandle};
use crate::traits::{GenerateOptions, SynthesizeOptions, TranscribeOptions, TtsPort};

/// Completed sentences waiting for synthesis. Small on purpose: a slow
/// egress socket backs the queue up, which stalls LLM consumption.
const SENTENCE_QUEUE_CAPACITY: usize = 8;

/// What triggered the turn.
pub enum TurnInput {
    Text(String),
    Audio { bytes: Vec<u8>, format: AudioFormat },
}

enum TurnError {
    Cancelled,
    SinkClosed,
    Provider,
}

/// How the LLM consumption loop ended.
enum GenEnd {
    Completed,
    Failed(&'static str),
    Cancelled,
    SinkClosed,
    /// The sentence queue's consumer is gone; the synthesis task will
    /// report why.
    SynthesisGone,
}

struct SynthOutcome {
    frames: u64,
    finalized: bool,
}

struct SynthFailure {
    frames: u64,
    message: &'static str,
}

enum SendStop {
    Cancelled,
    Closed,
}

/// Runs one turn of the conversation pipeline: ASR (for audio input), a
/// streaming LLM call fed through the sentence segmenter, and serial
/// per-sentence synthesis re-encoded to Opus frames. Spawned per turn;
/// reports progress to the dispatcher over the event channel.
pub struct TurnRunner {
    pub session_id: String,
    pub handle: TurnHandle,
    pub config: ConversationConfig,
    pub providers: Arc<ProviderRegistry>,
    pub characters: Arc<CharacterRegistry>,
    pub out: Sender<Outbound>,
    pub events: Sender<TurnEvent>,
    pub provider_deadline: Duration,
}

impl TurnRunner {
    pub async fn run(self, input: TurnInput) {
        let turn_id = self.handle.turn_id;
        info!(session = %self.session_id, turn = turn_id, "Turn started");
        let event = match self.run_inner(input).await {
            Ok(()) => {
                info!(session = %self.session_id, turn = turn_id, "Turn complete");
                TurnEvent::Finished { turn_id }
            }
            Err(TurnError::Cancelled) => {
                debug!(session = %self.session_id, turn = turn_id, "Turn cancelled");
                TurnEvent::Cancelled { turn_id }
            }
            Err(TurnError::SinkClosed) => {
                debug!(session = %self.session_id, turn = turn_id, "Outbound sink closed");
                TurnEvent::Failed { turn_id }
            }
            Err(TurnError::Provider) => TurnEvent::Failed { turn_id },
        };
        let _ = self.events.send(event).await;
    }

    async fn run_inner(&self, input: TurnInput) -> Result<(), TurnError> {
        let user_text = match input {
            TurnInput::Text(text) => text,
            TurnInput::Audio { bytes, format } => match self.transcribe(bytes, format).await? {
                Some(text) => text,
                // Nothing recognized; end the turn quietly.
                None => return Ok(()),
            },
        };

        // Resolve both remaining providers up front so a misconfigured TTS
        // fails the turn before we burn LLM tokens.
        let llm = match self
            .providers
            .resolve_llm(&self.config.llm_provider, &self.config.llm_model)
        {
            Ok(p) => p,
            Err(e) => {
                warn!("LLM resolution failed: {}", e);
                return Err(self.fail("对话服务不可用").await);
            }
        };
        let tts = match self
            .providers
            .resolve_tts(&self.config.tts_provider, &self.config.tts_model)
        {
            Ok(p) => p,
            Err(e) => {
                warn!("TTS resolution failed: {}", e);
                return Err(self.fail("语音合成服务不可用").await);
            }
        };

        self.set_phase(Phase::Generating).await;
        let card = self.characters.get_or_default(&self.config.character_id);
        let system_prompt = build_system_prompt(card, self.config.max_tokens);
        let gen_opts = GenerateOptions {
            model: self.config.llm_model.clone(),
            max_tokens: self.config.max_tokens,
        };

        let opened = tokio::select! {
            _ = self.handle.cancel.cancelled() => return Err(TurnError::Cancelled),
            res = timeout(
                self.provider_deadline,
                llm.generate_stream(&system_prompt, &user_text, &gen_opts),
            ) => res,
        };
        let mut tokens = match opened {
            Err(_) => return Err(self.fail("对话生成超时").await),
            Ok(Err(e)) => {
                error!("LLM call failed: {}", e);
                return Err(self.fail("对话生成失败").await);
            }
            Ok(Ok(stream)) => stream,
        };

        // Serial synthesis consumer. Its token is a child of the turn's so
        // an abort reaches it, but an LLM failure can stop it alone.
        let pipeline_cancel = self.handle.cancel.child_token();
        let (sentence_tx, sentence_rx) =
            tokio::sync::mpsc::channel::<String>(SENTENCE_QUEUE_CAPACITY);
        let job = SynthesisJob {
            tts,
            opts: SynthesizeOptions {
                model: self.config.tts_model.clone(),
                voice: self.config.tts_voice.clone(),
                speed: self.config.tts_speed,
                volume: self.config.tts_volume,
                format: AudioFormat::Pcm16le,
            },
            cancel: pipeline_cancel.clone(),
            out: self.out.clone(),
            events: self.events.clone(),
            turn_id: self.handle.turn_id,
            deadline: self.provider_deadline,
        };
        let synth = tokio::spawn(synthesize_turn(job, sentence_rx));

        let mut segmenter = SentenceSegmenter::new();
        let mut sentence_index = 0usize;

        let mut end = loop {
            let next = tokio::select! {
                _ = self.handle.cancel.cancelled() => break GenEnd::Cancelled,
                next = timeout(self.provider_deadline, tokens.next()) => match next {
                    Err(_) => break GenEnd::Failed("对话生成超时"),
                    Ok(v) => v,
                },
            };
            match next {
                None => break GenEnd::Completed,
                Some(Err(e)) => {
                    error!("LLM stream error: {}", e);
                    break GenEnd::Failed("对话生成失败");
                }
                Some(Ok(chunk)) => {
                    if !chunk.delta.is_empty() || chunk.finished {
                        if let Err(e) = self
                            .send_turn_text(ServerEvent::llm_token(
                                chunk.delta.clone(),
                                chunk.accumulated.clone(),
                                chunk.finished,
                            ))
                            .await
                        {
                            break e;
                        }
                    }
                    let mut stop = None;
                    for sentence in segmenter.push(&chunk.delta) {
                        if let Err(e) = self
                            .emit_sentence(&sentence_tx, sentence, &mut sentence_index)
                            .await
                        {
                            stop = Some(e);
                            break;
                        }
                    }
                    if let Some(e) = stop {
                        break e;
                    }
                    if chunk.finished {
                        break GenEnd::Completed;
                    }
                }
            }
        };

        if matches!(end, GenEnd::Completed) {
            if let Some(rest) = segmenter.flush() {
                if let Err(e) = self
                    .emit_sentence(&sentence_tx, rest, &mut sentence_index)
                    .await
                {
                    end = e;
                }
            }
        }

        // Close the queue so the synthesis task can finish the turn, stop
        // the upstream LLM call, and on failure paths stop synthesis too.
        drop(sentence_tx);
        drop(tokens);
        if !matches!(end, GenEnd::Completed) {
            pipeline_cancel.cancel();
        }

        let synth_res = match synth.await {
            Ok(res) => res,
            Err(e) => {
                error!("Synthesis task panicked: {}", e);
                Err(SynthFailure {
                    frames: 0,
                    message: "语音合成失败",
                })
            }
        };

        if self.handle.cancel.is_cancelled() {
            return Err(TurnError::Cancelled);
        }

        match (end, synth_res) {
            (GenEnd::Cancelled, _) => Err(TurnError::Cancelled),
            (GenEnd::SinkClosed, _) => Err(TurnError::SinkClosed),
            (GenEnd::Completed | GenEnd::SynthesisGone, Ok(outcome)) => {
                if outcome.finalized {
                    Ok(())
                } else {
                    // The task stopped sending without finishing the turn;
                    // the only non-cancel reason is a dead sink.
                    Err(TurnError::SinkClosed)
                }
            }
            (GenEnd::Completed | GenEnd::SynthesisGone, Err(failure)) => {
                if failure.frames > 0 {
                    self.close_audio_stream().await;
                }
                Err(self.fail(failure.message).await)
            }
            (GenEnd::Failed(message), synth_res) => {
                let frames = match &synth_res {
                    Ok(outcome) => outcome.frames,
                    Err(failure) => failure.frames,
                };
                if frames > 0 {
                    self.close_audio_stream().await;
                }
                Err(self.fail(message).await)
            }
        }
    }

    async fn transcribe(
        &self,
        bytes: Vec<u8>,
        format: AudioFormat,
    ) -> Result<Option<String>, TurnError> {
        self.set_phase(Phase::Transcribing).await;
        let asr = match self
            .providers
            .resolve_asr(&self.config.asr_provider, &self.config.asr_model)
        {
            Ok(p) => p,
            Err(e) => {
                warn!("ASR resolution failed: {}", e);
                return Err(self.fail("语音识别服务不可用").await);
            }
        };
        let opts = TranscribeOptions {
            model: self.config.asr_model.clone(),
            format,
            sample_rate: Some(self.config.asr_sample_rate),
            language: None,
        };

        let result = tokio::select! {
            _ = self.handle.cancel.cancelled() => return Err(TurnError::Cancelled),
            res = timeout(self.provider_deadline, asr.transcribe(&bytes, &opts)) => res,
        };
        let transcript = match result {
            Err(_) => return Err(self.fail("语音识别超时").await),
            Ok(Err(e)) => {
                error!("ASR failed: {}", e);
                return Err(self.fail("语音识别失败").await);
            }
            Ok(Ok(t)) => t,
        };

        info!(
            session = %self.session_id,
            turn = self.handle.turn_id,
            "Recognized: {}",
            transcript.text
        );
        self.send_turn_text(ServerEvent::stt(transcript.text.clone(), true))
            .await
            .map_err(|e| match e {
                GenEnd::Cancelled => TurnError::Cancelled,
                _ => TurnError::SinkClosed,
            })?;

        if transcript.text.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(transcript.text))
        }
    }

    async fn emit_sentence(
        &self,
        queue: &Sender<String>,
        sentence: String,
        index: &mut usize,
    ) -> Result<(), GenEnd> {
        debug!(turn = self.handle.turn_id, index = *index, "Sentence ready");
        self.send_turn_text(ServerEvent::sentence_end(sentence.clone(), *index))
            .await?;
        *index += 1;
        tokio::select! {
            _ = self.handle.cancel.cancelled() => Err(GenEnd::Cancelled),
            res = queue.send(sentence) => res.map_err(|_| GenEnd::SynthesisGone),
        }
    }

    async fn send_turn_text(&self, event: ServerEvent) -> Result<(), GenEnd> {
        let message = Message::Text(event.to_json().into());
        tokio::select! {
            _ = self.handle.cancel.cancelled() => Err(GenEnd::Cancelled),
            res = self.out.send(Outbound::for_turn(self.handle.turn_id, message)) => {
                res.map_err(|_| GenEnd::SinkClosed)
            }
        }
    }

    /// Sends the user-visible failure message and marks the turn failed.
    async fn fail(&self, message: &str) -> TurnError {
        let _ = self.send_turn_text(ServerEvent::error(message)).await;
        TurnError::Provider
    }

    /// Trailing empty frame that releases the client's audio pipeline when
    /// a turn dies after frames were already emitted.
    async fn close_audio_stream(&self) {
        let frame = BinaryFrame::tts(Vec::new(), true);
        let _ = self
            .out
            .send(Outbound::for_turn(
                self.handle.turn_id,
                Message::Binary(frame.encode().into()),
            ))
            .await;
    }

    async fn set_phase(&self, phase: Phase) {
        let _ = self
            .events
            .send(TurnEvent::Phase {
                turn_id: self.handle.turn_id,
                phase,
            })
            .await;
    }
}

struct SynthesisJob {
    tts: Arc<dyn TtsPort>,
    opts: SynthesizeOptions,
    cancel: CancellationToken,
    out: Sender<Outbound>,
    events: Sender<TurnEvent>,
    turn_id: u64,
    deadline: Duration,
}

impl SynthesisJob {
    async fn send_packet(
        &self,
        seq: &mut u64,
        payload: Vec<u8>,
        is_final: bool,
    ) -> Result<(), SendStop> {
        let frame = BinaryFrame::tts(payload, is_final);
        let message = Message::Binary(frame.encode().into());
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SendStop::Cancelled),
            res = self.out.send(Outbound::for_turn(self.turn_id, message)) => {
                res.map_err(|_| SendStop::Closed)?;
                debug!(turn = self.turn_id, seq = *seq, is_final, "TTS frame queued");
                *seq += 1;
                Ok(())
            }
        }
    }
}

/// Drains the sentence queue serially, synthesizing each sentence and
/// emitting Opus packets. One packet is always held back so the last one
/// of the turn can carry the final flag.
async fn synthesize_turn(
    job: SynthesisJob,
    mut sentences: Receiver<String>,
) -> Result<SynthOutcome, SynthFailure> {
    let mut egress = OpusEgress::new().map_err(|e| {
        error!("Opus encoder init failed: {}", e);
        SynthFailure {
            frames: 0,
            message: "语音合成失败",
        }
    })?;
    let mut seq: u64 = 0;
    let mut pending: Option<Vec<u8>> = None;
    let mut announced = false;

    loop {
        let sentence = tokio::select! {
            _ = job.cancel.cancelled() => {
                return Ok(SynthOutcome { frames: seq, finalized: false });
            }
            next = sentences.recv() => match next {
                Some(s) => s,
                None => break,
            },
        };
        if !announced {
            let _ = job
                .events
                .send(TurnEvent::Phase {
                    turn_id: job.turn_id,
                    phase: Phase::Synthesizing,
                })
                .await;
            announced = true;
        }

        let opened = tokio::select! {
            _ = job.cancel.cancelled() => {
                return Ok(SynthOutcome { frames: seq, finalized: false });
            }
            res = timeout(job.deadline, job.tts.synthesize_stream(&sentence, &job.opts)) => res,
        };
        let mut chunks = match opened {
            Err(_) => {
                return Err(SynthFailure {
                    frames: seq,
                    message: "语音合成超时",
                })
            }
            Ok(Err(e)) => {
                error!("TTS call failed: {}", e);
                return Err(SynthFailure {
                    frames: seq,
                    message: "语音合成失败",
                });
            }
            Ok(Ok(stream)) => stream,
        };

        loop {
            let next = tokio::select! {
                _ = job.cancel.cancelled() => {
                    return Ok(SynthOutcome { frames: seq, finalized: false });
                }
                next = timeout(job.deadline, chunks.next()) => match next {
                    Err(_) => {
                        return Err(SynthFailure {
                            frames: seq,
                            message: "语音合成超时",
                        })
                    }
                    Ok(v) => v,
                },
            };
            let chunk = match next {
                None => break,
                Some(Err(e)) => {
                    error!("TTS stream error: {}", e);
                    return Err(SynthFailure {
                        frames: seq,
                        message: "语音合成失败",
                    });
                }
                Some(Ok(c)) => c,
            };

            let packets = egress.push(&chunk.bytes).map_err(|e| {
                error!("Opus encode failed: {}", e);
                SynthFailure {
                    frames: seq,
                    message: "语音合成失败",
                }
            })?;
            for packet in packets {
                if let Some(prev) = pending.replace(packet) {
                    if job.send_packet(&mut seq, prev, false).await.is_err() {
                        return Ok(SynthOutcome {
                            frames: seq,
                            finalized: false,
                        });
                    }
                }
            }
            if chunk.finished {
                break;
            }
        }
    }

    // Queue closed: the turn is over. A cancel may have raced the close;
    // a cancelled turn must not finalize the audio stream.
    if job.cancel.is_cancelled() {
        return Ok(SynthOutcome {
            frames: seq,
            finalized: false,
        });
    }

    // Flush the residual and make sure the very last packet carries the
    // final flag. A turn with no audio at all still emits one empty final
    // frame to release the client pipeline.
    let residual = egress.finish().map_err(|e| {
        error!("Opus flush failed: {}", e);
        SynthFailure {
            frames: seq,
            message: "语音合成失败",
        }
    })?;
    let last = match (pending.take(), residual) {
        (Some(prev), Some(tail)) => {
            if job.send_packet(&mut seq, prev, false).await.is_err() {
                return Ok(SynthOutcome {
                    frames: seq,
                    finalized: false,
                });
            }
            tail
        }
        (Some(prev), None) => prev,
        (None, Some(tail)) => tail,
        (None, None) => Vec::new(),
    };
    match job.send_packet(&mut seq, last, true).await {
        Ok(()) => Ok(SynthOutcome {
            frames: seq,
            finalized: true,
        }),
        Err(_) => Ok(SynthOutcome {
            frames: seq,
            finalized: false,
        }),
    }
}
