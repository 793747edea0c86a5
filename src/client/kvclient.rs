//! One-shot client API stub.

use crate::core::{Address, Message};
use crate::utils::{tcp_request, CausalKvError};

/// Client stub bound to one replica. Every call opens a fresh connection,
/// sends one request, and waits for its reply.
#[derive(Debug, Clone)]
pub struct KvClient {
    /// Replica this client talks to.
    server: Address,
}

impl KvClient {
    /// Creates a new client stub for replica `server`.
    pub fn new(server: Address) -> Self {
        KvClient { server }
    }

    /// Replica this client talks to.
    pub fn server(&self) -> &Address {
        &self.server
    }

    /// Reads `key` at the replica.
    pub async fn read(
        &self,
        key: &str,
    ) -> Result<Option<String>, CausalKvError> {
        let req = Message::ReadFromClient { key: key.into() };
        match tcp_request(&self.server.to_string(), &req).await? {
            Message::ReadAnswer { key: k, value } if k == key => Ok(value),
            reply => logged_err!("c"; "unexpected read reply {:?}", reply),
        }
    }

    /// Writes `key` at the replica. Returns once the replica has applied it
    /// locally; propagation to peers continues in the background.
    pub async fn write(
        &self,
        key: &str,
        value: &str,
    ) -> Result<(), CausalKvError> {
        let req = Message::WriteFromClient {
            key: key.into(),
            value: value.into(),
        };
        match tcp_request(&self.server.to_string(), &req).await? {
            Message::Ack => Ok(()),
            reply => logged_err!("c"; "unexpected write reply {:?}", reply),
        }
    }
}

#[cfg(test)]
mod kvclient_tests {
    use super::*;
    use crate::utils::{safe_tcp_read, safe_tcp_write, tcp_bind_with_retry};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn read_and_write() -> Result<(), CausalKvError> {
        let listener =
            tcp_bind_with_retry("127.0.0.1:53950".parse()?, 3).await?;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await?;
            let req: Message = safe_tcp_read(&mut stream).await?;
            assert_eq!(
                req,
                Message::WriteFromClient {
                    key: "k".into(),
                    value: "v".into()
                }
            );
            safe_tcp_write(&mut stream, &Message::Ack).await?;

            let (mut stream, _) = listener.accept().await?;
            let req: Message = safe_tcp_read(&mut stream).await?;
            assert_eq!(req, Message::ReadFromClient { key: "k".into() });
            safe_tcp_write(
                &mut stream,
                &Message::ReadAnswer {
                    key: "k".into(),
                    value: Some("v".into()),
                },
            )
            .await?;
            Ok::<(), CausalKvError>(())
        });

        let client = KvClient::new(Address::new("127.0.0.1", 53950));
        client.write("k", "v").await?;
        assert_eq!(client.read("k").await?, Some("v".into()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unexpected_reply() -> Result<(), CausalKvError> {
        let listener =
            tcp_bind_with_retry("127.0.0.1:53951".parse()?, 3).await?;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await?;
            let _: Message = safe_tcp_read(&mut stream).await?;
            safe_tcp_write(&mut stream, &Message::Wait).await?;
            Ok::<(), CausalKvError>(())
        });

        let client = KvClient::new(Address::new("127.0.0.1", 53951));
        assert!(client.write("k", "v").await.is_err());
        Ok(())
    }
}
