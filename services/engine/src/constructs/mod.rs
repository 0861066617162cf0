//! Reusable resource builders
//!
//! Each construct declares a group of related resources into a [`Stack`]
//! and hands back the references its callers wire into other constructs.
//!
//! [`Stack`]: crate::template::Stack

pub mod access_user;
pub mod app_runner;
pub mod aurora;
pub mod bucket;
pub mod codebuild;
pub mod ecs_fargate;
pub mod function;
pub mod iam;
pub mod network_vpc;
pub mod route53;
pub mod ses;
pub mod waf;

pub use access_user::AccessUser;
pub use app_runner::{AppRunner, AppRunnerProps, AppRunnerScaling};
pub use aurora::{AuroraCluster, AuroraProps};
pub use bucket::Bucket;
pub use codebuild::{CodeBuildProject, CodeBuildProps};
pub use ecs_fargate::{EcsFargate, EcsFargateProps};
pub use function::{Function, FunctionProps};
pub use iam::{Grantee, PolicyStatement};
pub use network_vpc::{NetworkVpc, NetworkVpcProps};
pub use route53::{CertificateSource, HostedZone};
pub use ses::{EmailIdentity, SesProps, SimpleEmailService};
pub use waf::{WafRule, WebAcl, WebAclProps};
