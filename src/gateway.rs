//! WebSocket 推送网关
//!
//! 每个 WebSocket 连接对应一个订阅者。客户端以 JSON 消息（`type` 字段区分）
//! 订阅、取消订阅或一次性执行操作，订阅结果只推送给发起订阅的客户端

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use rat_logger::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::error::{LiveQueryError, LiveQueryResult};
use crate::operation::{OperationBuilder, OperationRequest, OperationTarget, Parameter, Row};
use crate::subscription::{
    SinkClosed, SubscriberId, SubscriptionEvent, SubscriptionId, SubscriptionManager,
    SubscriptionSink,
};

/// 客户端发来的消息
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// 创建订阅
    Subscribe {
        #[serde(default)]
        request_id: Option<String>,
        target: OperationTarget,
        #[serde(default)]
        params: Vec<Parameter>,
        #[serde(default)]
        interval_ms: Option<u64>,
    },
    /// 取消订阅
    Unsubscribe { subscription_id: SubscriptionId },
    /// 一次性执行
    Execute {
        #[serde(default)]
        request_id: Option<String>,
        target: OperationTarget,
        #[serde(default)]
        params: Vec<Parameter>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

/// 推送给客户端的消息
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        subscription_id: SubscriptionId,
    },
    Unsubscribed {
        subscription_id: SubscriptionId,
    },
    Update {
        subscription_id: SubscriptionId,
        timestamp: DateTime<Utc>,
        rows: Vec<Row>,
    },
    /// 订阅轮询失败或订阅请求被拒绝
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        subscription_id: Option<SubscriptionId>,
        kind: String,
        cause: String,
    },
    Result {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        rows: Vec<Row>,
        row_count: u64,
        elapsed_ms: u64,
    },
    ExecuteError {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        kind: String,
        cause: String,
    },
    /// 无法解析的消息
    ProtocolError { message: String },
}

impl From<SubscriptionEvent> for ServerMessage {
    fn from(event: SubscriptionEvent) -> Self {
        match event {
            SubscriptionEvent::Update {
                subscription_id,
                timestamp,
                rows,
            } => ServerMessage::Update {
                subscription_id,
                timestamp,
                rows,
            },
            SubscriptionEvent::Error {
                subscription_id,
                kind,
                cause,
            } => ServerMessage::Error {
                request_id: None,
                subscription_id: Some(subscription_id),
                kind,
                cause,
            },
        }
    }
}

/// 把订阅事件转发到客户端的发送队列
struct ClientSink(mpsc::UnboundedSender<ServerMessage>);

impl SubscriptionSink for ClientSink {
    fn deliver(&self, event: SubscriptionEvent) -> Result<(), SinkClosed> {
        self.0.send(event.into()).map_err(|_| SinkClosed)
    }
}

/// 已连接客户端信息
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
}

/// WebSocket 网关
#[derive(Clone)]
pub struct SubscriptionGateway {
    manager: SubscriptionManager,
    clients: Arc<DashMap<SubscriberId, ClientInfo>>,
}

impl SubscriptionGateway {
    pub fn new(manager: SubscriptionManager) -> Self {
        Self {
            manager,
            clients: Arc::new(DashMap::new()),
        }
    }

    /// 当前连接的客户端数
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// 绑定监听地址
    pub async fn bind(addr: &str) -> LiveQueryResult<TcpListener> {
        let listener = TcpListener::bind(addr).await?;
        info!("WebSocket网关监听: ws://{}", listener.local_addr()?);
        Ok(listener)
    }

    /// 接受连接直到 `shutdown` 完成
    ///
    /// 已建立的连接不受影响，由订阅管理器关闭时统一结束推送
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> LiveQueryResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("WebSocket网关停止接受新连接");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("接受连接失败: {}", e);
                            continue;
                        }
                    };
                    let gateway = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = gateway.handle_connection(stream, addr).await {
                            warn!("WebSocket连接处理失败: 地址={}, 错误={}", addr, e);
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(self, stream: TcpStream, addr: SocketAddr) -> LiveQueryResult<()> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| crate::quick_error!(connection, format!("WebSocket握手失败: {}", e)))?;
        let client_id: SubscriberId = uuid::Uuid::new_v4().simple().to_string();
        self.clients.insert(
            client_id.clone(),
            ClientInfo {
                addr,
                connected_at: Utc::now(),
            },
        );
        info!("客户端已连接: 客户端={}, 地址={}", client_id, addr);

        let (mut write, mut read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

        // 写端独立任务，所有发送方释放后退出
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("序列化推送消息失败: {}", e);
                        continue;
                    }
                };
                if write.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let sink: Arc<dyn SubscriptionSink> = Arc::new(ClientSink(outbound.clone()));
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    self.handle_text(&client_id, text.as_str(), &outbound, &sink);
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("读取WebSocket消息失败: 客户端={}, 错误={}", client_id, e);
                    break;
                }
            }
        }

        let cancelled = self.manager.on_subscriber_disconnect(&client_id);
        self.clients.remove(&client_id);
        info!("客户端已断开: 客户端={}, 取消订阅数={}", client_id, cancelled);
        Ok(())
    }

    fn handle_text(
        &self,
        client_id: &str,
        text: &str,
        outbound: &mpsc::UnboundedSender<ServerMessage>,
        sink: &Arc<dyn SubscriptionSink>,
    ) {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("无法解析客户端消息: 客户端={}, 错误={}", client_id, e);
                let _ = outbound.send(ServerMessage::ProtocolError {
                    message: e.to_string(),
                });
                return;
            }
        };

        match message {
            ClientMessage::Subscribe {
                request_id,
                target,
                params,
                interval_ms,
            } => {
                let subscribed = build_request(target, params, None).and_then(|request| {
                    self.manager
                        .subscribe(client_id, request, interval_ms, sink.clone())
                });
                let reply = match subscribed {
                    Ok(subscription_id) => ServerMessage::Subscribed {
                        request_id,
                        subscription_id,
                    },
                    Err(e) => ServerMessage::Error {
                        request_id,
                        subscription_id: None,
                        kind: e.kind().to_string(),
                        cause: e.to_string(),
                    },
                };
                let _ = outbound.send(reply);
            }
            ClientMessage::Unsubscribe { subscription_id } => {
                // 只能取消自己的订阅，未知订阅按已取消处理
                let owned = self
                    .manager
                    .list(client_id)
                    .iter()
                    .any(|info| info.id == subscription_id);
                if owned {
                    self.manager.unsubscribe(subscription_id);
                }
                let _ = outbound.send(ServerMessage::Unsubscribed { subscription_id });
            }
            ClientMessage::Execute {
                request_id,
                target,
                params,
                timeout_ms,
            } => {
                let manager = self.manager.clone();
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let executed = match build_request(target, params, timeout_ms) {
                        Ok(request) => manager.execute_once(&request).await,
                        Err(e) => Err(e),
                    };
                    let reply = match executed {
                        Ok(result) => ServerMessage::Result {
                            request_id,
                            rows: result.rows,
                            row_count: result.row_count,
                            elapsed_ms: result.elapsed_ms,
                        },
                        Err(e) => ServerMessage::ExecuteError {
                            request_id,
                            kind: e.kind().to_string(),
                            cause: e.to_string(),
                        },
                    };
                    let _ = outbound.send(reply);
                });
            }
        }
    }
}

fn build_request(
    target: OperationTarget,
    params: Vec<Parameter>,
    timeout_ms: Option<u64>,
) -> Result<OperationRequest, LiveQueryError> {
    let mut builder = OperationBuilder::new(target).params(params);
    if let Some(ms) = timeout_ms {
        builder = builder.timeout(Duration::from_millis(ms));
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubscriptionConfig;
    use crate::driver::MemoryDriver;
    use crate::executor::OperationExecutor;
    use crate::pool::ConnectionPool;
    use crate::types::{ConnectionConfig, DataValue, DatabaseConfig, DatabaseType, PoolConfig};

    #[test]
    fn test_client_message_format() {
        let message: ClientMessage = serde_json::from_str(
            r#"{"type": "subscribe", "target": {"procedure": "GetActiveOrders"},
                "params": [{"name": "deptId", "type": "Int", "value": 4}], "interval_ms": 2000}"#,
        )
        .unwrap();
        match message {
            ClientMessage::Subscribe {
                target,
                params,
                interval_ms,
                request_id,
            } => {
                assert!(target.is_procedure());
                assert_eq!(params.len(), 1);
                assert_eq!(interval_ms, Some(2000));
                assert!(request_id.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "drop_table"}"#).is_err());
    }

    #[test]
    fn test_server_message_format() {
        let id = SubscriptionId::new();
        let json = serde_json::to_value(ServerMessage::Error {
            request_id: None,
            subscription_id: Some(id),
            kind: "operation_error".to_string(),
            cause: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["subscription_id"], id.to_string());
        assert!(json.get("request_id").is_none());
    }

    async fn next_json(
        stream: &mut (impl futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
    ) -> serde_json::Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .expect("等待推送超时")
                .expect("连接已关闭")
                .unwrap();
            if let Message::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_websocket_round_trip() {
        let row: Row = [("total".to_string(), DataValue::Int(3))].into_iter().collect();
        let driver = MemoryDriver::new().with_rows("SELECT COUNT(*) AS total FROM orders", vec![row]);
        let config = DatabaseConfig {
            db_type: DatabaseType::SQLite,
            connection: ConnectionConfig::SQLite {
                path: ":memory:".to_string(),
                create_if_missing: true,
            },
            pool: PoolConfig {
                min_connections: 0,
                ..PoolConfig::default()
            },
            alias: "gateway".to_string(),
        };
        let pool = ConnectionPool::with_driver(config, Arc::new(driver)).unwrap();
        let manager = SubscriptionManager::new(OperationExecutor::new(pool), SubscriptionConfig::default());
        let gateway = SubscriptionGateway::new(manager.clone());

        let listener = SubscriptionGateway::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = gateway.clone();
        tokio::spawn(async move { server.serve(listener, std::future::pending()).await });

        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr)).await.unwrap();
        let (mut write, mut read) = ws.split();

        write
            .send(Message::text(
                r#"{"type": "subscribe", "request_id": "r1",
                    "target": {"query": "SELECT COUNT(*) AS total FROM orders"}, "interval_ms": 200}"#,
            ))
            .await
            .unwrap();

        // 首次推送可能先于订阅确认到达
        let mut seen = Vec::new();
        while seen.len() < 2 {
            let message = next_json(&mut read).await;
            seen.push(message["type"].as_str().unwrap().to_string());
            if message["type"] == "update" {
                assert_eq!(message["rows"][0]["total"], 3);
            }
        }
        assert!(seen.contains(&"subscribed".to_string()));
        assert!(seen.contains(&"update".to_string()));

        write.send(Message::text("not json")).await.unwrap();
        loop {
            let message = next_json(&mut read).await;
            if message["type"] == "protocol_error" {
                break;
            }
        }

        assert_eq!(gateway.client_count(), 1);
        assert_eq!(manager.active_count(), 1);

        write.send(Message::Close(None)).await.unwrap();
        for _ in 0..100 {
            if gateway.client_count() == 0 && manager.active_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(gateway.client_count(), 0);
        assert_eq!(manager.active_count(), 0);
    }
}
