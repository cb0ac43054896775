use anyhow::{anyhow, Context, Result};
use std::net::Ipv4Addr;
use std::time::Duration;

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use futures_util::stream::TryStreamExt;
    use rtnetlink::packet_route::address::{AddressAttribute, AddressMessage};
    use rtnetlink::packet_route::route::RouteMessage;
    use rtnetlink::packet_route::rule::RuleAction;
    use rtnetlink::packet_route::AddressFamily;
    use rtnetlink::{new_connection, Handle, LinkUnspec, RouteMessageBuilder};
    use std::net::IpAddr;
    use std::time::Instant;
    use tokio::time::sleep;

    #[derive(Clone)]
    pub struct Netlink {
        handle: Handle,
    }

    impl Netlink {
        pub async fn new() -> Result<Self> {
            let (connection, handle, _) =
                new_connection().context("failed to open netlink connection")?;
            tokio::spawn(connection);
            Ok(Netlink { handle })
        }

        pub async fn link_index(&self, name: &str) -> Result<Option<u32>> {
            let mut links = self
                .handle
                .link()
                .get()
                .match_name(name.to_string())
                .execute();
            if let Some(link) = links.try_next().await? {
                return Ok(Some(link.header.index));
            }
            Ok(None)
        }

        pub async fn wait_for_link(&self, name: &str, timeout: Duration) -> Result<u32> {
            let start = Instant::now();
            loop {
                if let Some(index) = self.link_index(name).await? {
                    return Ok(index);
                }
                if start.elapsed() > timeout {
                    return Err(anyhow!("interface {} did not appear", name));
                }
                sleep(Duration::from_millis(100)).await;
            }
        }

        pub async fn set_link_up(&self, index: u32) -> Result<()> {
            let link = LinkUnspec::new_with_index(index).up().build();
            self.handle.link().set(link).execute().await?;
            Ok(())
        }

        pub async fn add_address(&self, index: u32, address: Ipv4Addr) -> Result<()> {
            let mut req = self.handle.address().add(index, IpAddr::V4(address), 32);
            // rtnetlink always attaches IFA_BROADCAST for IPv4; on a /32
            // tunnel address that equals the host address and the kernel
            // then drops echo replies as broadcast traffic.
            req.message_mut()
                .attributes
                .retain(|attr| !matches!(attr, AddressAttribute::Broadcast(_)));
            req.execute().await?;
            Ok(())
        }

        pub async fn delete_address(&self, index: u32, address: Ipv4Addr) -> Result<()> {
            let mut msg = AddressMessage::default();
            msg.header.prefix_len = 32;
            msg.header.index = index;
            msg.header.family = AddressFamily::Inet;
            msg.attributes.push(AddressAttribute::Address(IpAddr::V4(address)));
            self.handle.address().del(msg).execute().await?;
            Ok(())
        }

        pub async fn delete_link(&self, name: &str) -> Result<()> {
            let mut links = self
                .handle
                .link()
                .get()
                .match_name(name.to_string())
                .execute();
            if let Some(link) = links.try_next().await? {
                self.handle.link().del(link.header.index).execute().await?;
            }
            Ok(())
        }

        /// Pins the encrypted underlay traffic for one peer to the
        /// physical default gateway in the main table.
        pub async fn add_endpoint_route(
            &self,
            endpoint: Ipv4Addr,
            gateway: Ipv4Addr,
        ) -> Result<()> {
            let route = RouteMessageBuilder::<Ipv4Addr>::new()
                .destination_prefix(endpoint, 32)
                .gateway(gateway)
                .priority(1)
                .build();
            self.handle.route().add(route).execute().await?;
            Ok(())
        }

        pub async fn add_tunnel_default_route(
            &self,
            inner: Ipv4Addr,
            index: u32,
            table: u32,
        ) -> Result<()> {
            let route = tunnel_default_route(inner, index, table);
            self.handle.route().add(route).execute().await?;
            Ok(())
        }

        pub async fn delete_tunnel_default_route(
            &self,
            inner: Ipv4Addr,
            index: u32,
            table: u32,
        ) -> Result<()> {
            let route = tunnel_default_route(inner, index, table);
            self.handle.route().del(route).execute().await?;
            Ok(())
        }

        pub async fn add_source_rule(&self, inner: Ipv4Addr, table: u32) -> Result<()> {
            self.handle
                .rule()
                .add()
                .v4()
                .source_prefix(inner, 32)
                .table_id(table)
                .action(RuleAction::ToTable)
                .execute()
                .await?;
            Ok(())
        }

        pub async fn delete_source_rule(&self, inner: Ipv4Addr, table: u32) -> Result<()> {
            let mut req = self
                .handle
                .rule()
                .add()
                .v4()
                .source_prefix(inner, 32)
                .table_id(table)
                .action(RuleAction::ToTable);
            let message = req.message_mut().clone();
            self.handle.rule().del(message).execute().await?;
            Ok(())
        }
    }

    fn tunnel_default_route(inner: Ipv4Addr, index: u32, table: u32) -> RouteMessage {
        RouteMessageBuilder::<Ipv4Addr>::new()
            .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
            .gateway(inner)
            .output_interface(index)
            .table_id(table)
            .build()
    }
}

#[cfg(target_os = "linux")]
pub use imp::Netlink;

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    #[derive(Clone)]
    pub struct Netlink;

    impl Netlink {
        pub async fn new() -> Result<Self> {
            Err(anyhow!("netlink is only supported on linux"))
        }

        pub async fn link_index(&self, _name: &str) -> Result<Option<u32>> {
            Err(anyhow!("netlink is only supported on linux"))
        }

        pub async fn wait_for_link(&self, _name: &str, _timeout: Duration) -> Result<u32> {
            Err(anyhow!("netlink is only supported on linux"))
        }

        pub async fn set_link_up(&self, _index: u32) -> Result<()> {
            Err(anyhow!("netlink is only supported on linux"))
        }

        pub async fn add_address(&self, _index: u32, _address: Ipv4Addr) -> Result<()> {
            Err(anyhow!("netlink is only supported on linux"))
        }

        pub async fn delete_address(&self, _index: u32, _address: Ipv4Addr) -> Result<()> {
            Err(anyhow!("netlink is only supported on linux"))
        }

        pub async fn delete_link(&self, _name: &str) -> Result<()> {
            Err(anyhow!("netlink is only supported on linux"))
        }

        pub async fn add_endpoint_route(
            &self,
            _endpoint: Ipv4Addr,
            _gateway: Ipv4Addr,
        ) -> Result<()> {
            Err(anyhow!("netlink is only supported on linux"))
        }

        pub async fn add_tunnel_default_route(
            &self,
            _inner: Ipv4Addr,
            _index: u32,
            _table: u32,
        ) -> Result<()> {
            Err(anyhow!("netlink is only supported on linux"))
        }

        pub async fn delete_tunnel_default_route(
            &self,
            _inner: Ipv4Addr,
            _index: u32,
            _table: u32,
        ) -> Result<()> {
            Err(anyhow!("netlink is only supported on linux"))
        }

        pub async fn add_source_rule(&self, _inner: Ipv4Addr, _table: u32) -> Result<()> {
            Err(anyhow!("netlink is only supported on linux"))
        }

        pub async fn delete_source_rule(&self, _inner: Ipv4Addr, _table: u32) -> Result<()> {
            Err(anyhow!("netlink is only supported on linux"))
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use imp::Netlink;
