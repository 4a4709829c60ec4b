use std::fs;
use std::path::Path;

use crate::error::ArtifactError;
use crate::state::Server;

const SOCKS_HOST: &str = "127.0.0.1";
const RDP_PORT: u16 = 3389;

/// Renders the desktop client's connection file.
///
/// The file holds one group whose proxy settings point at the local SOCKS
/// listener; every server inherits them. Output depends only on the
/// arguments, so unchanged inputs give byte-identical files. With no servers
/// a single placeholder entry keeps the file loadable.
pub fn synthesize_client_config(servers: &[Server], socks_port: u16, group_name: &str) -> String {
    let mut entries = String::new();
    if servers.is_empty() {
        entries.push_str(&server_entry("Server", "localhost", socks_port));
    }
    for server in servers {
        entries.push_str(&server_entry(&server.name, &server.host, socks_port));
    }

    format!(
        r#"<?xml version="1.0" encoding="utf-8" standalone="yes"?>
<MultiDesk>
	<Servers>
		<Group>
			<Properties>
				<Name>{group}</Name>
				<Description/>
				<InheritGeneral>0</InheritGeneral>
				<InheritProxy>0</InheritProxy>
				<ProxyType>1</ProxyType>
				<SocksHostname>{SOCKS_HOST}</SocksHostname>
				<SocksPort>{socks_port}</SocksPort>
				<SocksUserName/>
				<SocksPassword/>
				<InheritDisplay>0</InheritDisplay>
				<GroupCollapsed>0</GroupCollapsed>
				<UserName>Administrator</UserName>
				<Domain/>
				<Password/>
				<RDPPort>{RDP_PORT}</RDPPort>
				<DesktopHeight>0</DesktopHeight>
				<DesktopWidth>0</DesktopWidth>
				<ZoomLevel>100</ZoomLevel>
				<DesktopScaleFactor>0</DesktopScaleFactor>
				<ColorDepth>24</ColorDepth>
				<FullScreen>0</FullScreen>
				<ConnectToServerConsole>0</ConnectToServerConsole>
				<SmartSizing>1</SmartSizing>
			</Properties>
{entries}		</Group>
		<Properties>
			<Name/>
			<Description/>
			<InheritGeneral>1</InheritGeneral>
			<InheritProxy>1</InheritProxy>
			<InheritDisplay>1</InheritDisplay>
			<GroupCollapsed>0</GroupCollapsed>
		</Properties>
	</Servers>
	<Settings/>
	<ExternalTools>
		<ExternalTool Title="P&amp;ing" Command="%comspec%" Arguments="/k ping -t %server%" StartPath=""/>
		<ExternalTool Title="&amp;Query User" Command="%comspec%" Arguments="/k query user /server:%server%" StartPath=""/>
		<ExternalTool Title="&amp;Query Session" Command="%comspec%" Arguments="/k query session /server:%server%" StartPath=""/>
	</ExternalTools>
</MultiDesk>
"#,
        group = escape_xml(group_name),
    )
}

pub fn write_client_config(path: &Path, content: &str) -> Result<(), ArtifactError> {
    fs::write(path, content).map_err(|e| ArtifactError::io(path, e))
}

fn server_entry(name: &str, host: &str, socks_port: u16) -> String {
    format!(
        r#"			<Server>
				<Name>{name}</Name>
				<Description/>
				<Server>{host}</Server>
				<MacAddress/>
				<UseVMBus>0</UseVMBus>
				<EnhancedMode>0</EnhancedMode>
				<VMId/>
				<InheritGeneral>0</InheritGeneral>
				<EnableCredSspSupport>1</EnableCredSspSupport>
				<InheritProxy>1</InheritProxy>
				<InheritDisplay>1</InheritDisplay>
				<RedirectPrinters>0</RedirectPrinters>
				<RedirectClipboard>1</RedirectClipboard>
				<RedirectPorts>0</RedirectPorts>
				<RedirectSmartCards>0</RedirectSmartCards>
				<RedirectDrives>0</RedirectDrives>
				<DriveCollection/>
				<AudioRedirectionMode>0</AudioRedirectionMode>
				<AudioCaptureRedirectionMode>0</AudioCaptureRedirectionMode>
				<KeyboardHookMode>1</KeyboardHookMode>
				<StartProgramOnConnection>0</StartProgramOnConnection>
				<StartProgram/>
				<WorkDir/>
				<PerformanceFlags>384</PerformanceFlags>
				<BitmapPersistence>1</BitmapPersistence>
				<AutoReconnect>0</AutoReconnect>
				<BandwidthDetection>1</BandwidthDetection>
				<AuthenticationLevel>0</AuthenticationLevel>
				<GatewayProfileUsageMethod>0</GatewayProfileUsageMethod>
				<GatewayUsageMethod>1</GatewayUsageMethod>
				<GatewayHostname/>
				<GatewayCredsSource>4</GatewayCredsSource>
				<GatewayUserName/>
				<GatewayPassword/>
				<GatewayDomain/>
				<GatewayUseGeneralCred>1</GatewayUseGeneralCred>
				<UseClientName>0</UseClientName>
				<ClientName/>
				<ProxyType>0</ProxyType>
				<SocksHostname>{SOCKS_HOST}</SocksHostname>
				<SocksPort>{socks_port}</SocksPort>
				<SocksUserName/>
				<SocksPassword/>
				<UserName>Administrator</UserName>
				<Domain/>
				<Password/>
				<RDPPort>{RDP_PORT}</RDPPort>
			</Server>
"#,
        name = escape_xml(name),
        host = escape_xml(host),
    )
}

pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(name: &str, host: &str) -> Server {
        Server {
            id: "1".into(),
            name: name.into(),
            host: host.into(),
            port: 443,
        }
    }

    #[test]
    fn every_entry_points_at_local_socks_port() {
        let servers = vec![server("hk", "hk.example"), server("us", "us.example")];
        let xml = synthesize_client_config(&servers, 20001, "NextDesk");
        assert_eq!(xml.matches("<SocksPort>20001</SocksPort>").count(), 3);
        assert_eq!(xml.matches("<SocksHostname>127.0.0.1</SocksHostname>").count(), 3);
        assert!(xml.contains("<Server>hk.example</Server>"));
        assert!(xml.contains("<Name>NextDesk</Name>"));
        assert!(xml.contains("<RDPPort>3389</RDPPort>"));
    }

    #[test]
    fn output_is_byte_identical_for_same_inputs() {
        let servers = vec![server("a", "a.example")];
        assert_eq!(
            synthesize_client_config(&servers, 17897, "g"),
            synthesize_client_config(&servers, 17897, "g")
        );
    }

    #[test]
    fn empty_server_list_gets_placeholder() {
        let xml = synthesize_client_config(&[], 17897, "NextDesk");
        assert!(xml.contains("<Name>Server</Name>"));
        assert!(xml.contains("<Server>localhost</Server>"));
        assert!(xml.trim_end().ends_with("</MultiDesk>"));
    }

    #[test]
    fn names_are_escaped() {
        let xml = synthesize_client_config(&[server("R&D <\"x\">", "h'1")], 1, "a&b");
        assert!(xml.contains("<Name>R&amp;D &lt;&quot;x&quot;&gt;</Name>"));
        assert!(xml.contains("<Server>h&apos;1</Server>"));
        assert!(xml.contains("<Name>a&amp;b</Name>"));
    }
}
