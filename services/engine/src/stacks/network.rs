//! Network stack: the shared VPC

use serde_json::Value;
use tracing::info;

use crate::constructs::{NetworkVpc, NetworkVpcProps};
use crate::error::Result;
use crate::stacks::StackContext;
use crate::template::{ResourceRef, Stack};

/// Imported handles of the VPC, one value per subnet
#[derive(Debug, Clone)]
pub struct NetworkOutputs {
    pub vpc_id: Value,
    pub public_subnets: Vec<Value>,
    pub private_subnets: Vec<Value>,
    pub isolated_subnets: Vec<Value>,
}

fn export_subnets(stack: &mut Stack, tier: &str, subnets: &[ResourceRef]) -> Vec<Value> {
    subnets
        .iter()
        .enumerate()
        .map(|(i, subnet)| stack.export(&format!("{}Subnet{}Id", tier, i), subnet.reference()))
        .collect()
}

pub fn build(ctx: &StackContext<'_>) -> Result<(Stack, NetworkOutputs)> {
    let mut stack = ctx.new_stack("Network");
    let vpc = NetworkVpc::new(&mut stack, &ctx.resource_name("vpc"), &NetworkVpcProps::default())?;

    let vpc_id = stack.export("VpcId", vpc.vpc.reference());
    let public_subnets = export_subnets(&mut stack, "Public", &vpc.public_subnets);
    let private_subnets = export_subnets(&mut stack, "Private", &vpc.private_subnets);
    let isolated_subnets = export_subnets(&mut stack, "Isolated", &vpc.isolated_subnets);

    info!(
        stack = %stack.name(),
        cidr = %vpc.cidr,
        public = public_subnets.len(),
        private = private_subnets.len(),
        isolated = isolated_subnets.len(),
        "Network planned"
    );

    Ok((
        stack,
        NetworkOutputs {
            vpc_id,
            public_subnets,
            private_subnets,
            isolated_subnets,
        },
    ))
}
