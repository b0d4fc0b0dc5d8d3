use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::LazyLock;

#[derive(Debug, Serialize)]
pub struct VyosConfigCommand<'a> {
    pub op: VyosConfigOperation,
    pub path: Vec<Cow<'a, str>>,
}

#[derive(Debug, Serialize)]
pub struct VyosGetCommand<'a> {
    pub op: VyosGetOperation,
    pub path: Vec<Cow<'a, str>>,
}
impl<'a> VyosGetCommand<'a> {
    pub fn new(path: impl IntoIterator<Item = Cow<'a, str>>) -> Self {
        Self {
            op: VyosGetOperation::ReturnValues,
            path: path.into_iter().collect(),
        }
    }
}

#[derive(Debug, Serialize, Default)]
pub struct VyosSaveCommand {
    pub op: VyosSaveOperation,
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum VyosConfigOperation {
    Set,
    Delete,
}

#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum VyosSaveOperation {
    #[default]
    Save,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum VyosGetOperation {
    ReturnValues,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct VyosCommandResponse<T> {
    pub success: bool,
    pub data: T,
    pub error: Option<String>,
}

impl<'a> VyosConfigCommand<'a> {
    pub(super) fn new(op: VyosConfigOperation, path: Vec<Cow<'a, str>>) -> Self {
        Self { op, path }
    }
}

static FW_GROUP_PATH_GET: LazyLock<Vec<Cow<str>>> = LazyLock::new(|| {
    ["firewall", "group", "network-group", "", "network"]
        .into_iter()
        .map(Cow::from)
        .collect()
});
static FW_IPV6_GROUP_PATH_GET: LazyLock<Vec<Cow<str>>> = LazyLock::new(|| {
    ["firewall", "group", "ipv6-network-group", "", "network"]
        .into_iter()
        .map(Cow::from)
        .collect()
});

/// Members of the group holding `net`'s address family.
pub fn group_get<'a>(fw_group: &'a str, net: &IpNet) -> VyosGetCommand<'a> {
    let mut path = match net {
        IpNet::V4(_) => FW_GROUP_PATH_GET.clone(),
        IpNet::V6(_) => FW_IPV6_GROUP_PATH_GET.clone(),
    };
    path[3] = fw_group.into();

    VyosGetCommand::new(path)
}

fn group_set_path(fw_group: &str, net: &IpNet) -> Vec<Cow<'static, str>> {
    let group_kind = match net {
        IpNet::V4(_) => "network-group",
        IpNet::V6(_) => "ipv6-network-group",
    };
    vec![
        Cow::from("firewall"),
        Cow::from("group"),
        Cow::from(group_kind),
        Cow::from(fw_group.to_string()),
        Cow::from("network"),
        Cow::from(net.to_string()),
    ]
}

#[derive(Debug, Serialize)]
pub struct NetSet<'a>(pub &'a [IpNet]);
impl NetSet<'_> {
    pub fn into_vyos_commands(
        self,
        op: VyosConfigOperation,
        firewall_group: &str,
    ) -> Vec<VyosConfigCommand<'static>> {
        self.0
            .iter()
            .map(|net| VyosConfigCommand::new(op, group_set_path(firewall_group, net)))
            .collect()
    }
}
