//! Security stack: account threat detection

use serde_json::json;

use crate::error::Result;
use crate::stacks::StackContext;
use crate::template::Stack;

pub fn build(ctx: &StackContext<'_>) -> Result<Stack> {
    let mut stack = ctx.new_stack("Security");
    stack.add(
        "guard-duty",
        "AWS::GuardDuty::Detector",
        json!({
            "Enable": true,
            "DataSources": { "S3Logs": { "Enable": true } },
        }),
    )?;
    Ok(stack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stacks::tests::{context, redcap_config};

    #[test]
    fn test_detector_watches_s3() {
        let cfg = redcap_config("guardDuty: true\n");
        let stack = build(&context("stage", &cfg)).unwrap();
        let (id, detector) = stack.resources_of_type("AWS::GuardDuty::Detector").next().unwrap();
        assert_eq!(id, "guardduty");
        assert_eq!(detector.properties["DataSources"]["S3Logs"]["Enable"], true);
    }
}
