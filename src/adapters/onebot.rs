//! OneBot 侧传输: 反向 WebSocket 客户端 + HTTP 上报
//!
//! 每个配置的地址维持一条连接，断开后 3 秒重连。
//! 连接上收到的动作帧各自在独立任务里处理，响应写回同一条连接。

use crate::actions;
use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::onebot::{ActionFrame, MetaEvent};
use crate::{debug, error, info, warn};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};

const RECONNECT_DELAY: Duration = Duration::from_secs(3);

// ================= 上报出口 =================

/// 一个可以接收上报事件的 OneBot 端
pub trait EventSink: Send + Sync {
    fn id(&self) -> &str;

    fn send_payload(&self, payload: String) -> BridgeResult<()>;
}

/// 事件广播: 所有已连接的反向 WS + 配置的 HTTP 上报地址
pub struct Hub {
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    http: reqwest::Client,
    post_urls: Vec<String>,
    self_id: i64,
}

impl Hub {
    pub fn new(http: reqwest::Client, post_urls: Vec<String>, self_id: i64) -> Self {
        Self {
            sinks: RwLock::new(Vec::new()),
            http,
            post_urls,
            self_id,
        }
    }

    pub fn register(&self, sink: Arc<dyn EventSink>) {
        let mut sinks = self.sinks.write().unwrap_or_else(PoisonError::into_inner);
        sinks.retain(|s| s.id() != sink.id());
        sinks.push(sink);
    }

    pub fn unregister(&self, id: &str) {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| s.id() != id);
    }

    pub fn client_count(&self) -> usize {
        self.sinks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// 发给每一个端，个别失败不影响其他端，失败汇总后返回
    pub async fn broadcast<T: Serialize>(&self, event: &T) -> BridgeResult<()> {
        let text = simd_json::to_string(event)
            .map_err(|e| BridgeError::Transport(format!("事件序列化失败: {}", e)))?;

        // 拷贝一份快照，发送期间不持锁
        let sinks: Vec<Arc<dyn EventSink>> = self
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut failed = Vec::new();
        for sink in &sinks {
            if let Err(e) = sink.send_payload(text.clone()) {
                failed.push(format!("{}: {}", sink.id(), e));
            }
        }

        for url in &self.post_urls {
            if let Err(e) = self.post(url, &text).await {
                failed.push(format!("{}: {}", url, e));
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(BridgeError::Transport(failed.join("; ")))
        }
    }

    async fn post(&self, url: &str, body: &str) -> BridgeResult<()> {
        let resp = self
            .http
            .post(url)
            .header("X-Self-ID", self.self_id.to_string())
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(BridgeError::Transport(format!("HTTP {}", resp.status())));
        }
        Ok(())
    }
}

/// 反向 WS 连接的写端，实际写入由连接上的写任务完成
struct WsSink {
    id: String,
    tx: UnboundedSender<String>,
}

impl EventSink for WsSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn send_payload(&self, payload: String) -> BridgeResult<()> {
        self.tx
            .send(payload)
            .map_err(|_| BridgeError::Transport("连接已关闭".to_string()))
    }
}

// ================= 反向 WS 客户端 =================

/// 适配器入口: 每个地址一个重连循环
pub fn entry(bridge: Arc<Bridge>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let addresses = bridge.config().ws_address;
        if addresses.is_empty() {
            warn!(target: "OneBot", "未配置 ws_address，只使用 HTTP 上报");
            return;
        }

        let loops: Vec<_> = addresses
            .into_iter()
            .enumerate()
            .map(|(index, url)| tokio::spawn(run_client_loop(bridge.clone(), index, url)))
            .collect();
        futures_util::future::join_all(loops).await;
    })
}

pub async fn run_client_loop(bridge: Arc<Bridge>, index: usize, url: String) {
    loop {
        match connect_and_serve(&bridge, index, &url).await {
            Ok(()) => warn!(target: "OneBot", "[{}] 连接断开，3秒后重连...", url),
            Err(e) => error!(target: "OneBot", "[{}] 连接失败: {}。3秒后重试...", url, e),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

fn transport(e: impl std::fmt::Display) -> BridgeError {
    BridgeError::Transport(e.to_string())
}

fn queue<T: Serialize>(tx: &UnboundedSender<String>, payload: &T) -> bool {
    match simd_json::to_string(payload) {
        Ok(text) => tx.send(text).is_ok(),
        Err(e) => {
            error!(target: "OneBot", "序列化失败: {}", e);
            true
        }
    }
}

async fn connect_and_serve(bridge: &Arc<Bridge>, index: usize, url: &str) -> BridgeResult<()> {
    let config = bridge.config();
    let self_id = config.app_id;

    let mut request = url.into_client_request().map_err(transport)?;
    let headers = request.headers_mut();
    if let Some(token) = config.ws_token_for(index) {
        let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(transport)?;
        headers.insert("Authorization", value);
    }
    headers.insert("X-Self-ID", HeaderValue::from(self_id));
    headers.insert("X-Client-Role", HeaderValue::from_static("Universal"));

    let (ws_stream, _) = connect_async(request).await.map_err(transport)?;
    info!(target: "OneBot", "[{}] 连接成功！", url);

    let (mut write_half, mut read_half) = ws_stream.split();

    // 写任务独占写端，其余地方通过通道投递
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if write_half.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    queue(&tx, &MetaEvent::lifecycle(self_id));

    let interval = config.heartbeat_interval.max(1);
    let heartbeat = {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !queue(&tx, &MetaEvent::heartbeat(self_id, interval)) {
                    break;
                }
            }
        })
    };

    let sink_id = format!("ws#{}:{}", index, url);
    bridge.hub.register(Arc::new(WsSink {
        id: sink_id.clone(),
        tx: tx.clone(),
    }));

    let result = loop {
        match read_half.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                let mut data = text.as_bytes().to_vec();
                let bridge = bridge.clone();
                let tx = tx.clone();

                tokio::spawn(async move {
                    let frame = match ActionFrame::parse(&mut data) {
                        Ok(f) => f,
                        Err(e) => {
                            warn!(target: "OneBot", "忽略无效帧: {}", e);
                            return;
                        }
                    };
                    debug!(target: "OneBot", "收到动作 {}", frame.action);
                    let response = actions::handle(bridge, frame).await;
                    queue(&tx, &response);
                });
            }
            Some(Ok(WsMessage::Close(_))) | None => break Ok(()),
            Some(Err(e)) => break Err(transport(e)),
            Some(Ok(_)) => {}
        }
    };

    bridge.hub.unregister(&sink_id);
    heartbeat.abort();
    writer.abort();
    result
}
