//! VPC with public, private-with-egress and isolated subnet tiers

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::debug;

use crate::config::{Ipv4Cidr, LogRetention};
use crate::constructs::iam::{grant, service_role, Grantee, PolicyStatement};
use crate::error::{Result, SynthError};
use crate::template::{get_azs, select, RemovalPolicy, ResourceRef, Stack};

#[derive(Debug, Clone)]
pub struct NetworkVpcProps {
    pub max_azs: u32,
    pub cidr: Ipv4Cidr,
    pub cidr_mask: u8,
    pub public_subnet: bool,
    pub nat_subnet: bool,
    pub isolated_subnet: bool,
    /// Interface endpoint service short names, e.g. `secretsmanager`
    pub interface_endpoints: Vec<String>,
    pub s3_endpoint: bool,
    pub log_retention: LogRetention,
}

impl Default for NetworkVpcProps {
    fn default() -> Self {
        Self {
            max_azs: 2,
            cidr: Ipv4Cidr {
                address: std::net::Ipv4Addr::new(10, 0, 0, 0),
                prefix: 16,
            },
            cidr_mask: 24,
            public_subnet: true,
            nat_subnet: true,
            isolated_subnet: true,
            interface_endpoints: vec!["secretsmanager".to_string()],
            s3_endpoint: true,
            log_retention: LogRetention::TwoMonths,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Public,
    Private,
    Isolated,
}

impl Tier {
    fn name(self) -> &'static str {
        match self {
            Tier::Public => "public-subnet",
            Tier::Private => "private-subnet",
            Tier::Isolated => "isolated-subnet",
        }
    }
}

/// Handles of a declared VPC
#[derive(Debug, Clone)]
pub struct NetworkVpc {
    pub vpc: ResourceRef,
    pub cidr: Ipv4Cidr,
    pub public_subnets: Vec<ResourceRef>,
    pub private_subnets: Vec<ResourceRef>,
    pub isolated_subnets: Vec<ResourceRef>,
    /// Public IPs of the NAT gateways, one per AZ
    pub nat_public_ips: Vec<Value>,
    pub endpoints: BTreeMap<String, ResourceRef>,
    pub flow_log_group: ResourceRef,
}

impl NetworkVpc {
    pub fn new(stack: &mut Stack, id: &str, props: &NetworkVpcProps) -> Result<Self> {
        let mut tiers = Vec::new();
        if props.public_subnet {
            tiers.push(Tier::Public);
        }
        if props.nat_subnet {
            tiers.push(Tier::Private);
        }
        if props.isolated_subnet {
            tiers.push(Tier::Isolated);
        }
        if tiers.is_empty() {
            return Err(SynthError::NoSubnets);
        }
        if props.nat_subnet && !props.public_subnet {
            return Err(SynthError::invalid(
                "network",
                "private subnets with egress need public subnets for the NAT gateways",
            ));
        }

        let region = stack.region().to_string();
        let log_group = stack.add(
            &format!("{}-vpc-logs", id),
            "AWS::Logs::LogGroup",
            json!({
                "LogGroupName": format!("/{}/vpc-logs/", id),
                "RetentionInDays": props.log_retention.days(),
            }),
        )?;
        stack.apply_removal_policy(&log_group, RemovalPolicy::Destroy);

        let vpc = stack.add(
            &format!("{}-vpc", id),
            "AWS::EC2::VPC",
            json!({
                "CidrBlock": props.cidr.to_string(),
                "EnableDnsHostnames": true,
                "EnableDnsSupport": true,
                "Tags": [{ "Key": "Name", "Value": format!("{}-vpc", id) }],
            }),
        )?;

        let mut public_subnets = Vec::new();
        let mut private_subnets = Vec::new();
        let mut isolated_subnets = Vec::new();
        let mut private_route_tables = Vec::new();
        let mut isolated_route_tables = Vec::new();
        let mut nat_public_ips = Vec::new();

        let internet_gateway = if props.public_subnet {
            let igw = stack.add(&format!("{}-igw", id), "AWS::EC2::InternetGateway", json!({}))?;
            stack.add(
                &format!("{}-igw-attachment", id),
                "AWS::EC2::VPCGatewayAttachment",
                json!({ "VpcId": vpc.reference(), "InternetGatewayId": igw.reference() }),
            )?;
            Some(igw)
        } else {
            None
        };

        let mut block_index = 0u32;
        for tier in &tiers {
            for az in 0..props.max_azs {
                let cidr = props.cidr.subnet(props.cidr_mask, block_index).ok_or_else(|| {
                    SynthError::invalid("network", format!("{} has no room for subnet {}", props.cidr, block_index))
                })?;
                block_index += 1;

                let subnet_id = format!("{}-{}{}", id, tier.name(), az + 1);
                let subnet = stack.add(
                    &subnet_id,
                    "AWS::EC2::Subnet",
                    json!({
                        "VpcId": vpc.reference(),
                        "CidrBlock": cidr.to_string(),
                        "AvailabilityZone": select(az as usize, get_azs()),
                        "MapPublicIpOnLaunch": *tier == Tier::Public,
                        "Tags": [{ "Key": "Name", "Value": subnet_id }],
                    }),
                )?;
                let route_table = stack.add(
                    &format!("{}-rt", subnet_id),
                    "AWS::EC2::RouteTable",
                    json!({ "VpcId": vpc.reference() }),
                )?;
                stack.add(
                    &format!("{}-rt-association", subnet_id),
                    "AWS::EC2::SubnetRouteTableAssociation",
                    json!({ "SubnetId": subnet.reference(), "RouteTableId": route_table.reference() }),
                )?;

                match tier {
                    Tier::Public => {
                        if let Some(igw) = &internet_gateway {
                            stack.add(
                                &format!("{}-default-route", subnet_id),
                                "AWS::EC2::Route",
                                json!({
                                    "RouteTableId": route_table.reference(),
                                    "DestinationCidrBlock": "0.0.0.0/0",
                                    "GatewayId": igw.reference(),
                                }),
                            )?;
                        }
                        if props.nat_subnet {
                            let eip = stack.add(
                                &format!("{}-nat-eip{}", id, az),
                                "AWS::EC2::EIP",
                                json!({ "Domain": "vpc" }),
                            )?;
                            stack.add(
                                &format!("{}-nat{}", id, az),
                                "AWS::EC2::NatGateway",
                                json!({
                                    "SubnetId": subnet.reference(),
                                    "AllocationId": eip.attr("AllocationId"),
                                }),
                            )?;
                            nat_public_ips.push(eip.attr("PublicIp"));
                        }
                        public_subnets.push(subnet);
                    }
                    Tier::Private => {
                        stack.add(
                            &format!("{}-default-route", subnet_id),
                            "AWS::EC2::Route",
                            json!({
                                "RouteTableId": route_table.reference(),
                                "DestinationCidrBlock": "0.0.0.0/0",
                                "NatGatewayId": { "Ref": crate::template::logical_id(&format!("{}-nat{}", id, az)) },
                            }),
                        )?;
                        private_route_tables.push(route_table.reference());
                        private_subnets.push(subnet);
                    }
                    Tier::Isolated => {
                        isolated_route_tables.push(route_table.reference());
                        isolated_subnets.push(subnet);
                    }
                }
            }
        }

        let flow_log_role = service_role(stack, &format!("{}-flow-log-role", id), "vpc-flow-logs.amazonaws.com", &[])?;
        grant(
            stack,
            &format!("{}-flow-log-policy", id),
            &Grantee::Role(flow_log_role.clone()),
            &[PolicyStatement::allow(
                &["logs:CreateLogStream", "logs:PutLogEvents", "logs:DescribeLogStreams"],
                vec![log_group.arn()],
            )],
        )?;
        stack.add(
            &format!("{}-flow-log", id),
            "AWS::EC2::FlowLog",
            json!({
                "ResourceId": vpc.reference(),
                "ResourceType": "VPC",
                "TrafficType": "ALL",
                "LogDestinationType": "cloud-watch-logs",
                "LogGroupName": log_group.reference(),
                "DeliverLogsPermissionArn": flow_log_role.arn(),
            }),
        )?;

        let mut endpoints = BTreeMap::new();
        if !props.interface_endpoints.is_empty() {
            let endpoint_subnets: Vec<Value> = if private_subnets.is_empty() {
                isolated_subnets.iter().map(ResourceRef::reference).collect()
            } else {
                private_subnets.iter().map(ResourceRef::reference).collect()
            };
            let endpoint_sg = stack.add(
                &format!("{}-endpoints-sg", id),
                "AWS::EC2::SecurityGroup",
                json!({
                    "GroupDescription": "Interface endpoints",
                    "VpcId": vpc.reference(),
                    "SecurityGroupIngress": [{
                        "IpProtocol": "tcp",
                        "FromPort": 443,
                        "ToPort": 443,
                        "CidrIp": props.cidr.to_string(),
                    }],
                }),
            )?;
            for service in &props.interface_endpoints {
                let endpoint = stack.add(
                    &format!("{}-{}-vep", id, service),
                    "AWS::EC2::VPCEndpoint",
                    json!({
                        "VpcId": vpc.reference(),
                        "ServiceName": format!("com.amazonaws.{}.{}", region, service),
                        "VpcEndpointType": "Interface",
                        "PrivateDnsEnabled": true,
                        "SubnetIds": endpoint_subnets,
                        "SecurityGroupIds": [endpoint_sg.attr("GroupId")],
                    }),
                )?;
                endpoints.insert(service.clone(), endpoint);
            }
        }

        if props.s3_endpoint {
            let route_tables: Vec<Value> = private_route_tables
                .iter()
                .chain(&isolated_route_tables)
                .cloned()
                .collect();
            let endpoint = stack.add(
                &format!("{}-S3Endpoint", id),
                "AWS::EC2::VPCEndpoint",
                json!({
                    "VpcId": vpc.reference(),
                    "ServiceName": format!("com.amazonaws.{}.s3", region),
                    "VpcEndpointType": "Gateway",
                    "RouteTableIds": route_tables,
                }),
            )?;
            endpoints.insert("s3".to_string(), endpoint);
        }

        debug!(
            vpc = %id,
            public = public_subnets.len(),
            private = private_subnets.len(),
            isolated = isolated_subnets.len(),
            "Declared VPC"
        );

        Ok(Self {
            vpc,
            cidr: props.cidr,
            public_subnets,
            private_subnets,
            isolated_subnets,
            nat_public_ips,
            endpoints,
            flow_log_group: log_group,
        })
    }
}
