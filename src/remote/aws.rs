//! [`CloudApi`] implementation that shells out to the `aws` command-line
//! client.
//!
//! Every call passes `--region`; calls whose result is parsed also pass
//! `--output json`.

use std::ffi::OsString;

use camino::Utf8Path;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use super::api::{
    CloudApi, CloudError, CommandState, CommandStatus, ImageInfo, InstanceInfo, InstanceState,
    LaunchRequest, ShellCommand,
};
use crate::runner::{CommandOutput, CommandRunner, ProcessCommandRunner};

/// Tag key marking instances launched by this tool.
pub const RUN_TAG_KEY: &str = "SIMFERRY_RUN";

/// Managed command document used for every shell command.
pub const SHELL_DOCUMENT: &str = "AWS-RunShellScript";

/// Drives EC2, S3 and SSM through the `aws` binary.
#[derive(Clone, Debug)]
pub struct AwsCli<R: CommandRunner = ProcessCommandRunner> {
    bin: String,
    region: String,
    runner: R,
}

impl AwsCli {
    /// Creates a client using the real process runner.
    #[must_use]
    pub fn new(bin: impl Into<String>, region: impl Into<String>) -> Self {
        Self::with_runner(bin, region, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> AwsCli<R> {
    /// Creates a client that launches the binary through `runner`.
    #[must_use]
    pub fn with_runner(bin: impl Into<String>, region: impl Into<String>, runner: R) -> Self {
        Self {
            bin: bin.into(),
            region: region.into(),
            runner,
        }
    }

    fn invoke(&self, action: &str, args: Vec<OsString>) -> Result<CommandOutput, CloudError> {
        let mut full = args;
        full.push(OsString::from("--region"));
        full.push(OsString::from(&self.region));
        debug!(action, bin = %self.bin, "invoking provider client");
        let output = self.runner.run(&self.bin, &full)?;
        if output.is_success() {
            return Ok(output);
        }
        Err(CloudError::CommandFailure {
            action: action.to_owned(),
            status: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        })
    }

    fn invoke_json<T: DeserializeOwned>(
        &self,
        action: &str,
        args: Vec<OsString>,
    ) -> Result<T, CloudError> {
        let mut full = args;
        full.push(OsString::from("--output"));
        full.push(OsString::from("json"));
        let output = self.invoke(action, full)?;
        debug!(action, payload = %output.stdout, "provider response");
        serde_json::from_str(&output.stdout).map_err(|err| CloudError::Parse {
            action: action.to_owned(),
            message: err.to_string(),
        })
    }

    fn describe_instances(
        &self,
        action: &str,
        selector: Vec<OsString>,
    ) -> Result<Vec<InstanceInfo>, CloudError> {
        let mut args = os_args(&["ec2", "describe-instances"]);
        args.extend(selector);
        let response: DescribeInstances = self.invoke_json(action, args)?;
        Ok(response
            .reservations
            .into_iter()
            .flat_map(|reservation| reservation.instances)
            .map(Instance::into_info)
            .collect())
    }

    fn instance_action(&self, verb: &str, id: &str) -> Result<(), CloudError> {
        let action = format!("ec2 {verb}");
        let mut args = os_args(&["ec2", verb, "--instance-ids"]);
        args.push(OsString::from(id));
        self.invoke_json::<serde_json::Value>(&action, args)
            .map(|_| ())
    }
}

fn os_args(parts: &[&str]) -> Vec<OsString> {
    parts.iter().map(OsString::from).collect()
}

fn s3_url(bucket: &str, key: &str) -> String {
    format!("s3://{bucket}/{key}")
}

fn is_missing_object(stderr: &str) -> bool {
    ["(404)", "Not Found", "NoSuchKey", "does not exist"]
        .iter()
        .any(|marker| stderr.contains(marker))
}

impl<R: CommandRunner> CloudApi for AwsCli<R> {
    fn describe_images(&self, name_pattern: &str) -> Result<Vec<ImageInfo>, CloudError> {
        let mut args = os_args(&["ec2", "describe-images", "--filters"]);
        args.push(OsString::from(format!("Name=name,Values={name_pattern}")));
        let response: DescribeImages = self.invoke_json("ec2 describe-images", args)?;
        Ok(response
            .images
            .into_iter()
            .map(|image| ImageInfo {
                id: image.image_id,
                name: image.name,
            })
            .collect())
    }

    fn find_instances(&self, name: &str) -> Result<Vec<InstanceInfo>, CloudError> {
        let selector = vec![
            OsString::from("--filters"),
            OsString::from(format!("Name=tag:Name,Values={name}")),
            OsString::from("Name=instance-state-name,Values=running,stopped"),
        ];
        self.describe_instances("ec2 describe-instances", selector)
    }

    fn describe_instance(&self, id: &str) -> Result<InstanceInfo, CloudError> {
        let selector = vec![OsString::from("--instance-ids"), OsString::from(id)];
        self.describe_instances("ec2 describe-instances", selector)?
            .into_iter()
            .next()
            .ok_or_else(|| CloudError::NotFound {
                action: String::from("ec2 describe-instances"),
                resource: format!("instance {id}"),
            })
    }

    fn launch_instance(&self, request: &LaunchRequest) -> Result<String, CloudError> {
        let interfaces = json!([{
            "AssociatePublicIpAddress": true,
            "DeleteOnTermination": true,
            "Description": "simferry network interface",
            "DeviceIndex": 0,
            "Groups": [request.security_group_id],
            "SubnetId": request.subnet_id,
        }]);
        let tags = json!([{
            "ResourceType": "instance",
            "Tags": [
                {"Key": "Name", "Value": request.name},
                {"Key": RUN_TAG_KEY, "Value": request.run_token},
            ],
        }]);

        let mut args = os_args(&["ec2", "run-instances", "--count", "1", "--image-id"]);
        args.push(OsString::from(&request.image_id));
        args.push(OsString::from("--instance-type"));
        args.push(OsString::from(&request.instance_type));
        args.push(OsString::from("--network-interfaces"));
        args.push(OsString::from(interfaces.to_string()));
        args.push(OsString::from("--iam-instance-profile"));
        args.push(OsString::from(format!("Name={}", request.iam_profile)));
        args.push(OsString::from("--tag-specifications"));
        args.push(OsString::from(tags.to_string()));
        args.push(OsString::from("--client-token"));
        args.push(OsString::from(&request.client_token));
        if let Some(key_name) = &request.key_name {
            args.push(OsString::from("--key-name"));
            args.push(OsString::from(key_name));
        }
        if let Some(user_data) = &request.user_data {
            args.push(OsString::from("--user-data"));
            args.push(OsString::from(user_data));
        }

        let response: RunInstances = self.invoke_json("ec2 run-instances", args)?;
        response
            .instances
            .into_iter()
            .next()
            .map(|instance| instance.instance_id)
            .ok_or_else(|| CloudError::Parse {
                action: String::from("ec2 run-instances"),
                message: String::from("response lists no instances"),
            })
    }

    fn start_instance(&self, id: &str) -> Result<(), CloudError> {
        self.instance_action("start-instances", id)
    }

    fn stop_instance(&self, id: &str) -> Result<(), CloudError> {
        self.instance_action("stop-instances", id)
    }

    fn terminate_instance(&self, id: &str) -> Result<(), CloudError> {
        self.instance_action("terminate-instances", id)
    }

    fn upload_file(&self, local: &Utf8Path, bucket: &str, key: &str) -> Result<(), CloudError> {
        let args = vec![
            OsString::from("s3"),
            OsString::from("cp"),
            OsString::from(local.as_str()),
            OsString::from(s3_url(bucket, key)),
        ];
        self.invoke("s3 cp", args).map(|_| ())
    }

    fn upload_dir(&self, local: &Utf8Path, bucket: &str, prefix: &str) -> Result<(), CloudError> {
        let args = vec![
            OsString::from("s3"),
            OsString::from("cp"),
            OsString::from(local.as_str()),
            OsString::from(s3_url(bucket, &format!("{prefix}/"))),
            OsString::from("--recursive"),
        ];
        self.invoke("s3 cp --recursive", args).map(|_| ())
    }

    fn download_dir(
        &self,
        bucket: &str,
        prefix: &str,
        local: &Utf8Path,
    ) -> Result<(), CloudError> {
        let args = vec![
            OsString::from("s3"),
            OsString::from("cp"),
            OsString::from(s3_url(bucket, &format!("{prefix}/"))),
            OsString::from(local.as_str()),
            OsString::from("--recursive"),
        ];
        self.invoke("s3 cp --recursive", args).map(|_| ())
    }

    fn read_object(&self, bucket: &str, key: &str) -> Result<Option<String>, CloudError> {
        let args = vec![
            OsString::from("s3"),
            OsString::from("cp"),
            OsString::from(s3_url(bucket, key)),
            OsString::from("-"),
        ];
        match self.invoke("s3 cp", args) {
            Ok(output) => Ok(Some(output.stdout)),
            Err(CloudError::CommandFailure { stderr, .. }) if is_missing_object(&stderr) => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn delete_object(&self, bucket: &str, key: &str) -> Result<(), CloudError> {
        let args = vec![
            OsString::from("s3"),
            OsString::from("rm"),
            OsString::from(s3_url(bucket, key)),
        ];
        self.invoke("s3 rm", args).map(|_| ())
    }

    fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<(), CloudError> {
        let args = vec![
            OsString::from("s3"),
            OsString::from("rm"),
            OsString::from(s3_url(bucket, &format!("{prefix}/"))),
            OsString::from("--recursive"),
        ];
        self.invoke("s3 rm --recursive", args).map(|_| ())
    }

    fn send_command(&self, command: &ShellCommand) -> Result<String, CloudError> {
        let parameters = json!({
            "workingDirectory": [command.working_dir],
            "commands": command.commands,
        });
        let mut args = os_args(&["ssm", "send-command", "--document-name", SHELL_DOCUMENT]);
        args.push(OsString::from("--instance-ids"));
        args.push(OsString::from(&command.instance_id));
        args.push(OsString::from("--parameters"));
        args.push(OsString::from(parameters.to_string()));
        args.push(OsString::from("--output-s3-bucket-name"));
        args.push(OsString::from(&command.output_bucket));
        args.push(OsString::from("--output-s3-key-prefix"));
        args.push(OsString::from(&command.output_prefix));
        args.push(OsString::from("--timeout-seconds"));
        args.push(OsString::from(command.timeout_secs.to_string()));

        let response: SendCommand = self.invoke_json("ssm send-command", args)?;
        Ok(response.command.command_id)
    }

    fn command_status(
        &self,
        command_id: &str,
        instance_id: &str,
    ) -> Result<CommandStatus, CloudError> {
        let mut args = os_args(&["ssm", "get-command-invocation", "--command-id"]);
        args.push(OsString::from(command_id));
        args.push(OsString::from("--instance-id"));
        args.push(OsString::from(instance_id));
        let response: CommandInvocation = self.invoke_json("ssm get-command-invocation", args)?;
        let state = CommandState::from_provider(&response.status);
        Ok(CommandStatus {
            response_code: response.response_code.filter(|_| state.is_finished()),
            state,
            stdout: response.standard_output_content,
            stderr: response.standard_error_content,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeImages {
    #[serde(default)]
    images: Vec<Image>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Image {
    image_id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstances {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Instance {
    instance_id: String,
    state: Option<State>,
}

impl Instance {
    fn into_info(self) -> InstanceInfo {
        let state = self
            .state
            .map_or(InstanceState::Pending, |state| {
                InstanceState::from_provider(&state.name)
            });
        InstanceInfo {
            id: self.instance_id,
            state,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct State {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstances {
    #[serde(default)]
    instances: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendCommand {
    command: SentCommand,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SentCommand {
    command_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CommandInvocation {
    status: String,
    response_code: Option<i32>,
    #[serde(default)]
    standard_output_content: String,
    #[serde(default)]
    standard_error_content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use rstest::{fixture, rstest};

    #[fixture]
    fn runner() -> ScriptedRunner {
        ScriptedRunner::new()
    }

    fn client(runner: &ScriptedRunner) -> AwsCli<ScriptedRunner> {
        AwsCli::with_runner("aws", "eu-west-1", runner.clone())
    }

    #[rstest]
    fn images_are_listed_with_name_filter(runner: ScriptedRunner) {
        runner.push_output(
            Some(0),
            r#"{"Images":[{"ImageId":"ami-1","Name":"ArmVirtualHardware-1.2.0-x"}]}"#,
            "",
        );
        let images = client(&runner)
            .describe_images("ArmVirtualHardware-*")
            .expect("images");

        assert_eq!(
            images,
            [ImageInfo {
                id: String::from("ami-1"),
                name: String::from("ArmVirtualHardware-1.2.0-x"),
            }]
        );
        let invocation = runner.invocations().pop().expect("invocation");
        assert_eq!(
            invocation.command_string(),
            "aws ec2 describe-images --filters Name=name,Values=ArmVirtualHardware-* \
             --output json --region eu-west-1"
        );
    }

    #[rstest]
    fn instances_are_flattened_across_reservations(runner: ScriptedRunner) {
        runner.push_output(
            Some(0),
            r#"{"Reservations":[
                {"Instances":[{"InstanceId":"i-1","State":{"Name":"running"}}]},
                {"Instances":[{"InstanceId":"i-2","State":{"Name":"stopped"}}]}
            ]}"#,
            "",
        );
        let instances = client(&runner).find_instances("me@host").expect("instances");
        let states: Vec<_> = instances.into_iter().map(|info| info.state).collect();
        assert_eq!(states, [InstanceState::Running, InstanceState::Stopped]);
    }

    #[rstest]
    fn unknown_instance_is_not_found(runner: ScriptedRunner) {
        runner.push_output(Some(0), r#"{"Reservations":[]}"#, "");
        let err = client(&runner)
            .describe_instance("i-9")
            .expect_err("missing instance");
        assert!(matches!(err, CloudError::NotFound { .. }), "{err:?}");
    }

    #[rstest]
    fn launch_passes_tags_and_optional_arguments(runner: ScriptedRunner) {
        runner.push_output(Some(0), r#"{"Instances":[{"InstanceId":"i-new"}]}"#, "");
        let request = LaunchRequest {
            image_id: String::from("ami-1"),
            instance_type: String::from("c5.large"),
            iam_profile: String::from("profile"),
            security_group_id: String::from("sg-1"),
            subnet_id: String::from("subnet-1"),
            key_name: Some(String::from("key")),
            name: String::from("me@host"),
            run_token: String::from("token"),
            client_token: String::from("token-launch"),
            user_data: None,
        };

        let id = client(&runner).launch_instance(&request).expect("launch");

        assert_eq!(id, "i-new");
        let command = runner.invocations().pop().expect("invocation").command_string();
        assert!(command.contains("--key-name key"), "{command}");
        assert!(command.contains(r#""Value":"me@host""#), "{command}");
        assert!(command.contains(RUN_TAG_KEY), "{command}");
        assert!(command.contains("--client-token token-launch"), "{command}");
        assert!(!command.contains("--user-data"), "{command}");
    }

    #[rstest]
    fn failures_carry_stderr(runner: ScriptedRunner) {
        runner.push_output(Some(254), "", "An error occurred (Throttling)\n");
        let err = client(&runner)
            .terminate_instance("i-1")
            .expect_err("failure");
        assert_eq!(
            err,
            CloudError::CommandFailure {
                action: String::from("ec2 terminate-instances"),
                status: String::from("254"),
                stderr: String::from("An error occurred (Throttling)"),
            }
        );
    }

    #[rstest]
    fn missing_objects_read_as_none(runner: ScriptedRunner) {
        runner.push_output(Some(1), "", "fatal error: An error occurred (404) when calling");
        let text = client(&runner)
            .read_object("bucket", "ssm/cmd/stdout")
            .expect("read");
        assert_eq!(text, None);
    }

    #[rstest]
    fn send_command_uses_shell_document(runner: ScriptedRunner) {
        runner.push_output(Some(0), r#"{"Command":{"CommandId":"cmd-1"}}"#, "");
        let command = ShellCommand {
            instance_id: String::from("i-1"),
            commands: vec![String::from("echo hi")],
            working_dir: String::from("/home/ubuntu"),
            output_bucket: String::from("bucket"),
            output_prefix: String::from("ssm"),
            timeout_secs: 600,
        };

        let id = client(&runner).send_command(&command).expect("send");

        assert_eq!(id, "cmd-1");
        let line = runner.invocations().pop().expect("invocation").command_string();
        assert!(line.contains("--document-name AWS-RunShellScript"), "{line}");
        assert!(line.contains(r#""commands":["echo hi"]"#), "{line}");
        assert!(line.contains("--timeout-seconds 600"), "{line}");
    }

    #[rstest]
    #[case(r#"{"Status":"InProgress","ResponseCode":-1}"#, CommandState::InProgress, None)]
    #[case(r#"{"Status":"Failed","ResponseCode":3}"#, CommandState::Failed, Some(3))]
    #[case(
        r#"{"Status":"Success","ResponseCode":0,"StandardOutputContent":"ok"}"#,
        CommandState::Success,
        Some(0)
    )]
    fn invocation_status_is_parsed(
        runner: ScriptedRunner,
        #[case] payload: &str,
        #[case] state: CommandState,
        #[case] code: Option<i32>,
    ) {
        runner.push_output(Some(0), payload, "");
        let status = client(&runner)
            .command_status("cmd-1", "i-1")
            .expect("status");
        assert_eq!(status.state, state);
        assert_eq!(status.response_code, code);
    }
}
